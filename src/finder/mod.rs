//! Patch finding.
//!
//! This module contains the per-feature patch locators:
//!
//! - Reference resolution (literal references, branch sources, jump stubs)
//! - Declarative anchor-and-walk recipes
//! - The feature finders built on top of them
//!
//! [`find_patches`] runs a selection of features and collects one result
//! per feature; a failing feature never stops the others.

mod patch;
mod patches;
pub mod recipe;
pub mod resolve;

pub use patch::Patch;
pub use patches::{
    AMFI_CODE_DIRECTORY_HASH, AMFI_EXECVE_HOOK, CS_ENFORCEMENT_AMFI, PROC_ENFORCE_BACKSTEP,
    RET0_GADGET, SANDBOX_LABEL_UPDATE,
};

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::arm64::AddressSpace;
use crate::error::Result;
use crate::macho::KernelImage;

// =============================================================================
// Features
// =============================================================================

/// A named patch finder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Flip the byte behind the `proc_enforce` sysctl
    ProcEnforce,
    /// Redirect AMFI's code-directory hash `memcmp` to a return-zero gadget
    AmfiCodeDirectoryHash,
    /// Set the debugger-allowed flag stored ahead of the version string
    DebuggerFlag,
    /// Skip the sandbox label-update denial branch
    SandboxLabelUpdate,
    /// Neutralize AMFI's execve hook check
    AmfiExecveHook,
    /// Disable AMFI's code-signing enforcement block
    CsEnforcementAmfi,
}

impl Feature {
    /// Every feature, in the order [`find_patches`] runs them.
    pub const ALL: [Feature; 6] = [
        Feature::ProcEnforce,
        Feature::AmfiCodeDirectoryHash,
        Feature::DebuggerFlag,
        Feature::SandboxLabelUpdate,
        Feature::AmfiExecveHook,
        Feature::CsEnforcementAmfi,
    ];

    /// Short name used on the command line and in reports.
    pub fn name(self) -> &'static str {
        match self {
            Feature::ProcEnforce => "proc_enforce",
            Feature::AmfiCodeDirectoryHash => "amfi_cdhash",
            Feature::DebuggerFlag => "debugger",
            Feature::SandboxLabelUpdate => "sandbox_label",
            Feature::AmfiExecveHook => "amfi_execve",
            Feature::CsEnforcementAmfi => "cs_enforcement",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Feature::ALL.iter().map(|f| f.name()).collect();
                format!("unknown feature '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

// =============================================================================
// Options
// =============================================================================

/// Options for a patch-finding run.
///
/// The runtime slide is a property of the image and is set when loading it
/// (see [`KernelImage::from_slice`]).
#[derive(Debug, Clone)]
pub struct FinderOptions {
    /// Features to run, in order
    pub features: Vec<Feature>,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            features: Feature::ALL.to_vec(),
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Per-feature results of a run, in run order.
#[derive(Debug, Default)]
pub struct PatchReport {
    /// One entry per feature that was run
    pub entries: Vec<(Feature, Result<Patch>)>,
}

impl PatchReport {
    /// Returns the result for a feature, if it was run.
    pub fn get(&self, feature: Feature) -> Option<&Result<Patch>> {
        self.entries
            .iter()
            .find(|(f, _)| *f == feature)
            .map(|(_, result)| result)
    }

    /// Iterates over the features that produced a patch.
    pub fn found(&self) -> impl Iterator<Item = (Feature, &Patch)> {
        self.entries
            .iter()
            .filter_map(|(f, result)| result.as_ref().ok().map(|p| (*f, p)))
    }

    /// Number of features that produced a patch.
    pub fn found_count(&self) -> usize {
        self.found().count()
    }

    /// Number of features that were run.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no feature was run.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Finder
// =============================================================================

/// Shared state for the feature finders: the image and its executable space.
pub struct PatchFinder<'i, 'a> {
    image: &'i KernelImage<'a>,
    text: AddressSpace<'i>,
}

impl<'i, 'a> PatchFinder<'i, 'a> {
    /// Creates a finder over an image.
    pub fn new(image: &'i KernelImage<'a>) -> Self {
        let text = image.text_space();
        debug!(
            "Text space: {} executable segments",
            text.segments().len()
        );
        Self { image, text }
    }

    /// Returns the image being searched.
    #[inline]
    pub fn image(&self) -> &'i KernelImage<'a> {
        self.image
    }

    /// Returns the executable address space.
    #[inline]
    pub fn text(&self) -> &AddressSpace<'i> {
        &self.text
    }

    /// Runs a single feature finder.
    pub fn find(&self, feature: Feature) -> Result<Patch> {
        match feature {
            Feature::ProcEnforce => self.proc_enforce(),
            Feature::AmfiCodeDirectoryHash => self.amfi_code_directory_hash(),
            Feature::DebuggerFlag => self.debugger_flag(),
            Feature::SandboxLabelUpdate => self.sandbox_label_update(),
            Feature::AmfiExecveHook => self.amfi_execve_hook(),
            Feature::CsEnforcementAmfi => self.cs_enforcement_amfi(),
        }
    }
}

/// Runs the selected features against an image.
///
/// Every feature gets an entry in the report, whether it succeeded or not.
pub fn find_patches(image: &KernelImage<'_>, options: &FinderOptions) -> PatchReport {
    let finder = PatchFinder::new(image);
    let mut report = PatchReport::default();

    for &feature in &options.features {
        let result = finder.find(feature);
        match &result {
            Ok(patch) => info!("{}: {} bytes at {:#x}", feature, patch.len(), patch.location),
            Err(e) if e.is_feature_absent() => warn!("{}: not found: {}", feature, e),
            Err(e) => warn!("{}: failed: {}", feature, e),
        }
        report.entries.push((feature, result));
    }

    info!(
        "Found {}/{} patches",
        report.found_count(),
        report.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_names_roundtrip() {
        for feature in Feature::ALL {
            assert_eq!(feature.name().parse::<Feature>().unwrap(), feature);
        }
        let err = "nosuid".parse::<Feature>().unwrap_err();
        assert!(err.contains("proc_enforce"));
    }

    #[test]
    fn test_default_options_select_everything() {
        let options = FinderOptions::default();
        assert_eq!(options.features, Feature::ALL);
    }
}
