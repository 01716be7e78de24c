#[derive(Debug, Default)]
pub struct MessageCounts {
    received: u64,
    mirrored: u64,
}

impl MessageCounts {
    pub fn new() -> Self {
        MessageCounts::default()
    }

    pub fn received(&self) -> u64 {
        self.received
    }
    pub fn increment_received(&mut self) {
        self.received += 1;
    }

    /// Messages copied to the intercept destination
    pub fn mirrored(&self) -> u64 {
        self.mirrored
    }
    pub fn increment_mirrored(&mut self) {
        self.mirrored += 1;
    }
}
