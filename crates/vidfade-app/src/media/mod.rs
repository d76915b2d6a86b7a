pub mod framework;
pub mod image;
pub mod pipeline;
pub mod soft;
pub mod stream;
pub mod worker;

pub use image::SharedImage;
pub use soft::SoftFramework;
pub use worker::DecodeWorker;
