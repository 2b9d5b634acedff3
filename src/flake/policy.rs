use clap::ValueEnum;

/// How resolution treats an existing lock file and the registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockPolicy {
    /// Only locked inputs are used; no registry lookups, nothing written
    Pure,
    /// Like `pure`, but the top-level reference may be looked up
    TopUsesRegistries,
    /// Use the lock file, fetch missing inputs, never write
    UseExistingAllowUpdated,
    /// Use the lock file, fetch missing inputs, write the result
    Update,
    /// Ignore the lock file and write a fresh one
    Recreate,
    /// Ignore the lock file and never write
    UseFreshUnwritten,
}

impl LockPolicy {
    pub fn may_write(self) -> bool {
        matches!(self, LockPolicy::Update | LockPolicy::Recreate)
    }

    /// Whether the existing lock file is ignored
    pub fn start_from_empty(self) -> bool {
        matches!(self, LockPolicy::Recreate | LockPolicy::UseFreshUnwritten)
    }

    pub fn may_use_registries(self, is_top_level: bool) -> bool {
        match self {
            LockPolicy::Pure => false,
            LockPolicy::TopUsesRegistries => is_top_level,
            _ => true,
        }
    }

    /// Whether an input missing from the lock may be fetched from its
    /// declared reference
    pub fn may_fetch_unlocked(self) -> bool {
        !matches!(self, LockPolicy::Pure | LockPolicy::TopUsesRegistries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        use LockPolicy::*;

        let all = [Pure, TopUsesRegistries, UseExistingAllowUpdated, Update, Recreate, UseFreshUnwritten];
        let writers: Vec<_> = all.iter().filter(|p| p.may_write()).collect();
        assert_eq!(writers, vec![&Update, &Recreate]);

        let fresh: Vec<_> = all.iter().filter(|p| p.start_from_empty()).collect();
        assert_eq!(fresh, vec![&Recreate, &UseFreshUnwritten]);

        assert!(!Pure.may_use_registries(true));
        assert!(TopUsesRegistries.may_use_registries(true));
        assert!(!TopUsesRegistries.may_use_registries(false));
        assert!(UseExistingAllowUpdated.may_use_registries(false));

        assert!(!Pure.may_fetch_unlocked());
        assert!(!TopUsesRegistries.may_fetch_unlocked());
        assert!(UseFreshUnwritten.may_fetch_unlocked());
    }

    #[test]
    fn test_cli_names() {
        assert_eq!(
            LockPolicy::from_str("top-uses-registries", false).unwrap(),
            LockPolicy::TopUsesRegistries
        );
        assert_eq!(
            LockPolicy::from_str("use-existing-allow-updated", false).unwrap(),
            LockPolicy::UseExistingAllowUpdated
        );
    }
}
