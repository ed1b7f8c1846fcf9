//! Command history for consrv
//!
//! Each connecting process is associated with a history buffer keyed by its
//! application name. Buffers outlive the processes that used them, so a
//! second `cmd.exe` picks up the buffer the first one left behind. What a
//! buffer stores is up to the line editor; this pool only hands them out.

use thiserror::Error;

/// Default number of history buffers in a session
pub const DEFAULT_BUFFER_COUNT: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("all {0} history buffers are in use")]
    Exhausted(usize),
}

/// A single application's command history slot
#[derive(Clone, Debug)]
pub struct CommandHistory {
    /// Application the buffer belongs to
    pub app_name: String,
    /// Process currently attached, if any
    owner: Option<u32>,
    /// Allocation stamp for LRU recycling
    last_used: u64,
}

impl CommandHistory {
    fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            owner: None,
            last_used: 0,
        }
    }

    fn matches(&self, app_name: &str) -> bool {
        self.app_name.eq_ignore_ascii_case(app_name)
    }
}

/// Fixed-capacity set of history buffers shared by a session
#[derive(Debug)]
pub struct HistoryPool {
    buffers: Vec<CommandHistory>,
    max_buffers: usize,
    clock: u64,
}

impl Default for HistoryPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_COUNT)
    }
}

impl HistoryPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Vec::new(),
            max_buffers,
            clock: 0,
        }
    }

    /// Attach `pid` to a buffer for `app_name`.
    ///
    /// Prefers a free buffer already holding that application's history,
    /// then a new buffer, then the least recently used free buffer, which is
    /// handed over to the new application.
    pub fn allocate(&mut self, app_name: &str, pid: u32) -> Result<&mut CommandHistory, HistoryError> {
        self.clock += 1;
        let stamp = self.clock;

        let index = if let Some(i) = self
            .buffers
            .iter()
            .position(|h| h.owner.is_none() && h.matches(app_name))
        {
            i
        } else if self.buffers.len() < self.max_buffers {
            self.buffers.push(CommandHistory::new(app_name));
            self.buffers.len() - 1
        } else {
            let i = self
                .buffers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.owner.is_none())
                .min_by_key(|(_, h)| h.last_used)
                .map(|(i, _)| i)
                .ok_or(HistoryError::Exhausted(self.max_buffers))?;
            self.buffers[i] = CommandHistory::new(app_name);
            i
        };

        let history = &mut self.buffers[index];
        history.owner = Some(pid);
        history.last_used = stamp;
        Ok(history)
    }

    /// Detach `pid` from its buffer. The buffer stays for the next process.
    pub fn free(&mut self, pid: u32) -> bool {
        match self.buffers.iter_mut().find(|h| h.owner == Some(pid)) {
            Some(history) => {
                history.owner = None;
                true
            }
            None => false,
        }
    }

    /// Buffer attached to `pid`
    #[cfg(test)]
    pub fn find(&self, pid: u32) -> Option<&CommandHistory> {
        self.buffers.iter().find(|h| h.owner == Some(pid))
    }

    /// Number of buffers created so far
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuses_buffer_for_same_app() {
        let mut pool = HistoryPool::default();
        pool.allocate("cmd.exe", 1).unwrap();
        assert!(pool.free(1));
        assert!(!pool.free(1));

        let history = pool.allocate("CMD.EXE", 2).unwrap();
        assert_eq!(history.app_name, "cmd.exe");
        assert_eq!(history.owner, Some(2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_busy_buffer_is_not_shared() {
        let mut pool = HistoryPool::default();
        pool.allocate("cmd.exe", 1).unwrap();
        pool.allocate("cmd.exe", 2).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.find(1).and_then(|h| h.owner), Some(1));
        assert_eq!(pool.find(2).and_then(|h| h.owner), Some(2));
    }

    #[test]
    fn test_recycles_least_recently_used() {
        let mut pool = HistoryPool::new(2);
        pool.allocate("a.exe", 1).unwrap();
        pool.allocate("b.exe", 2).unwrap();
        pool.free(1);
        pool.free(2);

        let history = pool.allocate("c.exe", 3).unwrap();
        assert_eq!(history.app_name, "c.exe");
        assert_eq!(pool.len(), 2);

        // b.exe survived the recycle, a.exe did not
        assert_eq!(pool.allocate("b.exe", 4).unwrap().app_name, "b.exe");
        assert_eq!(
            pool.allocate("a.exe", 5).unwrap_err(),
            HistoryError::Exhausted(2)
        );
    }

    #[test]
    fn test_exhausted_when_all_attached() {
        let mut pool = HistoryPool::new(1);
        pool.allocate("a.exe", 1).unwrap();
        assert_eq!(
            pool.allocate("b.exe", 2).unwrap_err(),
            HistoryError::Exhausted(1)
        );
    }
}
