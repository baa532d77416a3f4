use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RebindError {
    /// Storage for the copied rebinding batch could not be allocated. The
    /// global registry is left untouched when this is returned.
    #[error("unable to allocate storage for the rebinding batch")]
    Allocation(#[from] std::collections::TryReserveError),
}
