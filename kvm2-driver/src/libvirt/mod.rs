//! Libvirt connector.
//!
//! Talks to a real libvirt daemon. Requires the `libvirt` feature and the
//! libvirt client library on the build host.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::{LibvirtConnection, LibvirtConnector};

/// Check if the libvirt connector is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_availability_follows_feature() {
        assert_eq!(super::is_available(), cfg!(feature = "libvirt"));
    }
}
