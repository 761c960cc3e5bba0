//! Ctrl-C escalation for a run in the foreground.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Ask the compressor to stop and keep reporting until it exits.
    Cancel,
    /// Stop waiting. Dropping the run kills the compressor group.
    Abort,
}

/// Counts Ctrl-C presses: the first cancels, any later one aborts.
#[derive(Debug, Default)]
pub struct InterruptEscalation {
    presses: u32,
}

impl InterruptEscalation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self) -> InterruptAction {
        self.presses = self.presses.saturating_add(1);
        if self.presses == 1 {
            InterruptAction::Cancel
        } else {
            InterruptAction::Abort
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_press_cancels_then_aborts() {
        let mut interrupts = InterruptEscalation::new();
        assert_eq!(interrupts.press(), InterruptAction::Cancel);
        assert_eq!(interrupts.press(), InterruptAction::Abort);
        assert_eq!(interrupts.press(), InterruptAction::Abort);
    }
}
