//! Resolution status shared by the pagination, id and list loaders

/// Lifecycle status of a fetch-backed view.
///
/// `Idle` means no query is configured (or an id was explicitly reset);
/// `Pending` means a resolution is in flight. Mutations that are satisfiable
/// entirely from cache may go `Success -> Success` without visiting
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

impl Status {
    /// Convenience check used by views to decide whether data is usable.
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending)
    }
}
