//! End-of-epoch callbacks.

/// What the loop should do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Stops training after `patience` consecutive epochs in which the monitored
/// metric did not improve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyStopping {
    patience: usize,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            stale: 0,
        }
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Epochs since the last improvement.
    pub fn stale_epochs(&self) -> usize {
        self.stale
    }

    pub fn reset(&mut self) {
        self.stale = 0;
    }

    pub fn on_epoch_end(&mut self, improved: bool) -> CallbackAction {
        if improved {
            self.stale = 0;
            return CallbackAction::Continue;
        }
        self.stale += 1;
        if self.stale >= self.patience {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}
