//! Progress reporting for long-running writes.

/// Somewhere to send percent-complete updates.
///
/// Reporting is best-effort: nothing a sink does can affect the write.
pub trait Progress {
    fn report(&mut self, percent: u8);
}

/// A sink that discards every report
#[derive(Debug, Default, Copy, Clone)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&mut self, _percent: u8) {}
}

impl Progress for howudoin::Tx {
    fn report(&mut self, percent: u8) {
        self.set_pos(u64::from(percent));
    }
}

impl Progress for Vec<u8> {
    fn report(&mut self, percent: u8) {
        self.push(percent);
    }
}
