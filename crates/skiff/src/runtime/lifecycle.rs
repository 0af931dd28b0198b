//! Container start phases.

/// Phases of a container start, used to label start failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Resolving the image.
    Image,
    /// Resolving namespaces to join.
    Namespaces,
    /// Choosing the command.
    Command,
    /// Launching the process.
    Process,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Namespaces => write!(f, "namespaces"),
            Self::Command => write!(f, "command"),
            Self::Process => write!(f, "process"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display() {
        assert_eq!(LifecyclePhase::Image.to_string(), "image");
        assert_eq!(LifecyclePhase::Namespaces.to_string(), "namespaces");
        assert_eq!(LifecyclePhase::Process.to_string(), "process");
    }
}
