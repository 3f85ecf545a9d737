//! Plateau-reduction learning-rate policy.

use tracing::info;

/// Reduces the learning rate once a monitored loss stops improving.
///
/// Min-mode policy: an epoch improves when its loss drops below the best seen
/// value by a relative `threshold`. After `patience` consecutive
/// non-improving epochs the rate is multiplied by `factor`, bounded below by
/// `min_lr`. For `cooldown` epochs after a reduction the bad-epoch count is
/// held at zero, so patience counting restarts once the cooldown expires.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    /// Creates a scheduler starting at `lr` with a relative improvement
    /// threshold of 1e-4 and no cooldown.
    pub fn new(lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr,
            factor,
            patience,
            threshold: 1e-4,
            cooldown: 0,
            min_lr,
            best: None,
            bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    /// Sets the cooldown window applied after each reduction.
    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// The current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Records one epoch's loss. Returns the new learning rate when a
    /// reduction happened, `None` otherwise.
    pub fn step(&mut self, loss: f64) -> Option<f64> {
        let improved = match self.best {
            Some(best) => loss < best * (1.0 - self.threshold),
            None => true,
        };
        if improved {
            self.best = Some(loss);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }
        // The cooldown runs down once per epoch regardless of improvement and
        // masks the bad-epoch count while it is active.
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.bad_epochs = 0;
        }
        if self.bad_epochs > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            self.bad_epochs = 0;
            self.cooldown_counter = self.cooldown;
            if reduced < self.lr {
                self.lr = reduced;
                info!(lr = self.lr, "learning rate reduced on plateau");
                return Some(self.lr);
            }
        }
        None
    }
}
