//! Idempotent device writes

/// Remembers the last value written to one device channel and skips writes
/// that would repeat it.
#[derive(Debug, Clone)]
pub struct ActuationGuard<T> {
    last: Option<T>,
}

impl<T: Copy + PartialEq> ActuationGuard<T> {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Last value handed to a successful write
    pub fn last(&self) -> Option<T> {
        self.last
    }

    pub fn is_current(&self, target: T) -> bool {
        self.last == Some(target)
    }

    /// Run `write` unless `target` equals the last applied value.
    ///
    /// `force` writes regardless. The cache is only updated when `write`
    /// succeeds. Returns whether a write was issued.
    pub fn apply<E, F>(&mut self, target: T, force: bool, write: F) -> Result<bool, E>
    where
        F: FnOnce(T) -> Result<(), E>,
    {
        if !force && self.is_current(target) {
            return Ok(false);
        }

        write(target)?;
        self.last = Some(target);
        Ok(true)
    }

    /// Forget the cached value so the next apply always writes
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

impl<T: Copy + PartialEq> Default for ActuationGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_repeated_targets() {
        let mut guard = ActuationGuard::new();
        let mut writes = Vec::new();

        for target in [40, 40, 45, 45, 45, 40] {
            guard
                .apply(target, false, |v| {
                    writes.push(v);
                    Ok::<(), ()>(())
                })
                .unwrap();
        }

        assert_eq!(writes, vec![40, 45, 40]);
        assert_eq!(guard.last(), Some(40));
    }

    #[test]
    fn test_force_writes_same_value() {
        let mut guard = ActuationGuard::new();
        let mut count = 0;
        for _ in 0..3 {
            guard
                .apply((1500, 1530), true, |_| {
                    count += 1;
                    Ok::<(), ()>(())
                })
                .unwrap();
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_failed_write_leaves_cache_untouched() {
        let mut guard = ActuationGuard::new();
        guard.apply(10, false, |_| Ok::<(), ()>(())).unwrap();
        assert_eq!(guard.apply(20, false, |_| Err("boom")), Err("boom"));
        assert_eq!(guard.last(), Some(10));

        guard.invalidate();
        assert!(!guard.is_current(10));
    }
}
