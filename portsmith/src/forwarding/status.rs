//! Health status reporting
//!
//! Connection handlers report through a bounded channel with a drop-on-full
//! policy: a slow (or absent) status consumer must never stall the data
//! plane.

/// Bounded capacity of the status channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 10;

/// How many recent error messages the window retains.
pub const MAX_RECENT_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub health: HealthStatus,
    pub message: String,
}

/// Rolling window of recent connection errors plus a running total.
#[derive(Debug, Default)]
pub struct ErrorWindow {
    recent: Vec<String>,
    count: u64,
}

impl ErrorWindow {
    /// Append a formatted error, trimming to the newest
    /// [`MAX_RECENT_ERRORS`]. Returns the running total.
    pub fn record(&mut self, message: String) -> u64 {
        self.recent.push(message);
        if self.recent.len() > MAX_RECENT_ERRORS {
            self.recent.remove(0);
        }
        self.count += 1;
        self.count
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.count = 0;
    }

    pub fn recent(&self) -> &[String] {
        &self.recent
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn window_trims_to_newest_five() {
        let mut window = ErrorWindow::default();
        for i in 0..8 {
            window.record(format!("error {i}"));
        }

        assert_eq!(window.count(), 8);
        assert_eq!(window.recent().len(), MAX_RECENT_ERRORS);
        assert_eq!(window.recent()[0], "error 3");
        assert_eq!(window.recent()[4], "error 7");
    }

    #[test]
    fn window_clear_resets_everything() {
        let mut window = ErrorWindow::default();
        window.record("boom".to_string());
        window.clear();

        assert_eq!(window.count(), 0);
        assert!(window.recent().is_empty());
    }

    #[tokio::test]
    async fn full_status_channel_never_blocks_senders() {
        let (tx, _rx) = mpsc::channel::<StatusUpdate>(STATUS_CHANNEL_CAPACITY);

        for _ in 0..STATUS_CHANNEL_CAPACITY {
            tx.try_send(StatusUpdate {
                health: HealthStatus::Degraded,
                message: "fill".to_string(),
            })
            .unwrap();
        }

        // Channel is full; the send returns immediately with an error
        // instead of waiting for the consumer.
        let result = tx.try_send(StatusUpdate {
            health: HealthStatus::Degraded,
            message: "dropped".to_string(),
        });
        assert!(result.is_err());
    }
}
