//! Ordered endpoint list with a moving candidate index.

/// Failover candidates, primary first. Each socket error moves to the next
/// candidate; a successful open returns to the primary.
#[derive(Debug, Clone)]
pub struct FailoverList {
    endpoints: Vec<String>,
    index: usize,
}

impl FailoverList {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints, index: 0 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &str {
        self.endpoints
            .get(self.index)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Full URL of the current candidate.
    pub fn url(&self, app_id: &str) -> String {
        let base = self.current();
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}app_id={app_id}")
    }

    pub fn on_error(&mut self) {
        if !self.endpoints.is_empty() {
            self.index = (self.index + 1) % self.endpoints.len();
        }
    }

    pub fn on_open(&mut self) {
        self.index = 0;
    }
}
