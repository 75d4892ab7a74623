/// Rate limit for progress reports: one every `every` completions plus one
/// at each batch end, never two for the same completion count.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    total: usize,
    every: usize,
    completed: usize,
    last_reported: Option<usize>,
}

impl ProgressThrottle {
    pub(crate) fn new(total: usize, every: usize) -> Self {
        Self {
            total,
            every: every.max(1),
            completed: 0,
            last_reported: None,
        }
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    pub(crate) fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.completed.min(self.total) * 100 / self.total) as u8
    }

    /// Count one finished item; returns the percentage if a report is due.
    pub(crate) fn record(&mut self) -> Option<u8> {
        self.completed += 1;
        if self.completed % self.every == 0 {
            self.take()
        } else {
            None
        }
    }

    /// Report whatever has not been reported yet.
    pub(crate) fn flush(&mut self) -> Option<u8> {
        self.take()
    }

    fn take(&mut self) -> Option<u8> {
        if self.last_reported == Some(self.completed) {
            return None;
        }
        self.last_reported = Some(self.completed);
        Some(self.percent())
    }
}
