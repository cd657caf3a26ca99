//! Host I/O seam (§6.3): capability-gated effect primitives. Like
//! `scheduler.rs`, this defines the boundary the VM calls through; actual
//! file/network/clock access is an external collaborator.

use crate::error::HostError;
use crate::value::Boxed64;

pub type HostResult = Result<Boxed64, HostError>;

/// A single host-provided effect (read a file, open a socket, read the
/// clock, ...). Implementations check the calling block's capability set
/// before performing the effect and return `HostError::CapabilityDenied`
/// if it's missing.
pub trait HostPrimitive {
    fn name(&self) -> &str;

    /// The capability name this primitive is gated behind.
    fn required_capability(&self) -> &str;

    fn invoke(&self, args: &[Boxed64]) -> HostResult;
}

/// Looks up and invokes a named primitive only if `capabilities` grants
/// it; otherwise fails closed without calling `invoke`.
pub fn call_gated(
    primitive: &dyn HostPrimitive,
    capabilities: &[String],
    args: &[Boxed64],
) -> HostResult {
    if !capabilities.iter().any(|c| c == primitive.required_capability()) {
        return Err(HostError::CapabilityDenied(primitive.required_capability().to_string()));
    }
    primitive.invoke(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl HostPrimitive for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn required_capability(&self) -> &str {
            "io.echo"
        }
        fn invoke(&self, args: &[Boxed64]) -> HostResult {
            Ok(args.first().copied().unwrap_or_default())
        }
    }

    #[test]
    fn denies_without_capability() {
        let err = call_gated(&Echo, &[], &[]).unwrap_err();
        assert!(matches!(err, HostError::CapabilityDenied(_)));
    }

    #[test]
    fn allows_with_capability() {
        let caps = vec!["io.echo".to_string()];
        let result = call_gated(&Echo, &caps, &[Boxed64::encode_int(9)]).unwrap();
        assert_eq!(result.decode_int(), 9);
    }
}
