use std::fmt;

/// Failures reported synchronously by the retrieval entry points.
///
/// None of these are produced by the asynchronous disposal machinery: a
/// disposal task that loses a race simply does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainError {
    /// A retrieval was attempted outside [`Composition::render`](crate::Composition::render).
    MissingComposition,
    /// The active composition has no [`ContainerOwner`](crate::ContainerOwner).
    MissingContainerOwner,
    /// The active composition has no lifecycle registry to observe.
    MissingLifecycle,
    /// The owner was cleared and no longer hands out a container.
    OwnerCleared,
    /// The controller type has no nameable key.
    AnonymousController { type_name: &'static str },
    /// A controller store already holds a controller of another type under `key`.
    ControllerTypeMismatch { key: String, expected: &'static str },
    /// A slot holds a value of another type than the one requested.
    SlotTypeMismatch { slot: String, expected: &'static str },
}

impl fmt::Display for RetainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetainError::MissingComposition => {
                write!(f, "retained values can only be requested while composing")
            }
            RetainError::MissingContainerOwner => {
                write!(f, "no container owner is installed in the current composition")
            }
            RetainError::MissingLifecycle => {
                write!(f, "no lifecycle is installed in the current composition")
            }
            RetainError::OwnerCleared => write!(f, "container owner has already been cleared"),
            RetainError::AnonymousController { type_name } => {
                write!(f, "controller type {type_name} has no nameable key")
            }
            RetainError::ControllerTypeMismatch { key, expected } => {
                write!(f, "controller under {key} is not a {expected}")
            }
            RetainError::SlotTypeMismatch { slot, expected } => {
                write!(f, "slot {slot} does not hold a {expected}")
            }
        }
    }
}

impl std::error::Error for RetainError {}
