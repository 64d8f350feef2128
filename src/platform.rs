//! Platform identification and manifest selection.
//!
//! Identifies the platform this binary was built for and maps it to a
//! preference-ordered list of manifest architecture tags. Guests always
//! run linux, so only `linux` manifests are eligible regardless of the
//! host OS.

use crate::error::{Error, Result};
use crate::registry::ManifestDescriptor;

/// Platform this binary was built for.
///
/// No runtime probing: the set of images a host can boot is fixed at
/// compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformVariant {
    X86_64,
    Aarch64,
    Unknown,
}

impl PlatformVariant {
    /// Returns the platform this binary was built for.
    pub fn built() -> Self {
        #[cfg(target_arch = "x86_64")]
        return Self::X86_64;

        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        return Self::Unknown;
    }

    /// Manifest architecture tags this platform can boot, most preferred
    /// first. 64-bit images are preferred where the hardware can run
    /// several widths.
    pub fn preferred_tags(&self) -> Result<&'static [&'static str]> {
        match self {
            Self::X86_64 => Ok(&["amd64", "386"]),
            Self::Aarch64 => Ok(&["arm64v8", "armv8", "armv7", "armv5"]),
            Self::Unknown => Err(Error::UnsupportedHostPlatform),
        }
    }
}

/// Picks the most suitable manifest for `variant` out of an index.
///
/// Only `linux` descriptors are considered. Ties are broken strictly by
/// the preference order of [`PlatformVariant::preferred_tags`]. Returns
/// [`Error::NoSuitableManifest`] (carrying the platform tags that were
/// available) when nothing matches.
pub fn select_manifest<'a>(
    variant: PlatformVariant,
    descriptors: &'a [ManifestDescriptor],
) -> Result<&'a ManifestDescriptor> {
    let preferences = variant.preferred_tags()?;

    let eligible: Vec<&ManifestDescriptor> =
        descriptors.iter().filter(|d| d.os == "linux").collect();

    for tag in preferences {
        if let Some(found) = eligible.iter().find(|d| d.platform_tag() == *tag) {
            return Ok(*found);
        }
    }

    Err(Error::NoSuitableManifest {
        available: descriptors.iter().map(|d| d.describe()).collect(),
    })
}
