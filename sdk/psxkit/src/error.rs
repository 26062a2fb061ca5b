use core::fmt;

/// Errors reported by the runtime.
///
/// None of these are fatal. Hardware timeouts are not represented here at
/// all: they are logged and the call returns its usual value so the
/// foreground program can decide what to do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A channel index outside the range the controller implements.
    InvalidChannel(u8),
    /// The draw queue already holds [`QUEUE_LENGTH`](crate::queue::QUEUE_LENGTH)
    /// operations. The rejected operation was dropped.
    QueueFull,
    /// [`Console::reset_callback`](crate::Console::reset_callback) was called
    /// while the dispatcher was already installed.
    AlreadyInstalled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidChannel(index) => write!(f, "invalid channel index {}", index),
            Error::QueueFull => f.write_str("draw queue overflow"),
            Error::AlreadyInstalled => f.write_str("interrupt dispatcher already installed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_channel() {
        assert_eq!(Error::InvalidChannel(12).to_string(), "invalid channel index 12");
        assert_eq!(Error::QueueFull.to_string(), "draw queue overflow");
    }
}
