use std::time::Instant;

/// Rate value marking a fade that reached its target.
const FINISHED: f32 = -1.0;

/// Alpha after `elapsed_secs` of a fade from `start` toward `target` at
/// `rate` units per second, clamped at the target once crossed.
pub fn fade_alpha(start: f32, target: f32, rate: f32, elapsed_secs: f32) -> f32 {
    let direction = (target - start).signum();
    if target == start || rate < 0.0 {
        return target;
    }
    let alpha = start + elapsed_secs.max(0.0) * rate * direction;
    if (direction > 0.0 && alpha >= target) || (direction < 0.0 && alpha <= target) {
        target
    } else {
        alpha
    }
}

/// One-shot fade owned by the render loop.
#[derive(Debug, Clone)]
pub struct FadeAnimator {
    start_time: Instant,
    start_alpha: f32,
    target_alpha: f32,
    /// Alpha units per second; `FINISHED` once the target is reached.
    rate: f32,
}

impl FadeAnimator {
    pub fn new(start_time: Instant, start_alpha: f32, target_alpha: f32, rate: f32) -> Self {
        Self {
            start_time,
            start_alpha,
            target_alpha,
            rate: if rate < 0.0 { FINISHED } else { rate },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.rate < 0.0
    }

    /// Advance against the shared alpha. Inert once the target was reached.
    pub fn advance(&mut self, now: Instant, alpha: &mut f32) {
        if self.is_finished() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.start_time).as_secs_f32();
        let next = fade_alpha(self.start_alpha, self.target_alpha, self.rate, elapsed);
        *alpha = next;
        if next == self.target_alpha {
            self.rate = FINISHED;
            log::debug!("Fade reached {:.2} after {elapsed:.2}s", self.target_alpha);
        }
    }
}
