//! # Watch
//!
//! The watch-list of modules the engine cares about, and the completion mask that makes every
//! module's corrective actions run at most once no matter how often, or in which order, load
//! notifications arrive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::host::ModuleId;

/// Where and how big a module turned out to be once it was loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    /// Host handle of the module
    pub id: ModuleId,
    /// Load address
    pub address: usize,
    /// Size of the loaded image
    pub size: usize,
}

/// A module declared before any loading happens
#[derive(Debug)]
pub struct WatchedModule {
    /// Bundle identifier
    identifier: &'static str,
    /// Candidate on-disk locations of the binary
    paths: &'static [&'static str],
    /// Bit owned by this module in the completion mask
    bit: u32,
    /// Filled in by the first load notification
    loaded: OnceLock<LoadedModule>,
}

impl WatchedModule {
    /// Bundle identifier
    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    /// Candidate on-disk locations
    pub fn paths(&self) -> &'static [&'static str] {
        self.paths
    }

    /// Completion bit
    pub fn bit(&self) -> u32 {
        self.bit
    }

    /// Load information, once the module has been seen
    pub fn loaded(&self) -> Option<LoadedModule> {
        self.loaded.get().copied()
    }
}

/// Progress of a single watched module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// No load notification yet
    NotSeen,
    /// Loaded, actions not started
    Seen {
        /// Load address
        address: usize,
        /// Image size
        size: usize,
    },
    /// Actions are being applied
    ActionsPending,
    /// Every enabled action was attempted
    ActionsComplete,
}

/// Monotonic bitmask of attempted work.
///
/// A bit is *claimed* right before its actions run and *completed* right after. Claiming is a
/// single atomic `fetch_or`, so only one caller ever wins a bit and no bit is ever cleared.
#[derive(Debug)]
pub struct CompletionState {
    /// Bits whose actions have started
    claimed: AtomicU32,
    /// Bits whose actions have finished
    completed: AtomicU32,
    /// Every defined bit
    everything: u32,
}

impl CompletionState {
    /// Creates a mask where `everything` is the OR of all defined bits
    pub fn new(everything: u32) -> Self {
        Self {
            claimed: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            everything,
        }
    }

    /// The "fully done" value
    pub fn everything(&self) -> u32 {
        self.everything
    }

    /// Claims `bit`, returning `true` for the one caller that flipped it
    pub fn claim(&self, bit: u32) -> bool {
        self.claimed.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Marks a claimed `bit` as finished
    pub fn complete(&self, bit: u32) {
        self.claimed.fetch_or(bit, Ordering::AcqRel);
        self.completed.fetch_or(bit, Ordering::AcqRel);
    }

    /// Claims and finishes `bit` without doing any work
    pub fn skip(&self, bit: u32) {
        self.complete(bit)
    }

    /// Returns `true` once `bit` has been claimed
    pub fn is_claimed(&self, bit: u32) -> bool {
        self.claimed.load(Ordering::Acquire) & bit != 0
    }

    /// Returns `true` once `bit` has been completed
    pub fn is_complete(&self, bit: u32) -> bool {
        self.completed.load(Ordering::Acquire) & bit != 0
    }

    /// Current value of the mask
    pub fn mask(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Returns `true` once nothing is left to claim
    pub fn is_done(&self) -> bool {
        self.claimed.load(Ordering::Acquire) == self.everything
    }

    /// Marks every bit as finished
    pub fn finish_all(&self) {
        self.complete(self.everything)
    }
}

/// Bit reserved for the module independent host-ready action
pub const HOST_READY: u32 = 1;

/// Declared modules plus their completion state
#[derive(Debug)]
pub struct WatchList {
    /// Modules in declaration order
    modules: Vec<WatchedModule>,
    /// Completion mask covering the modules and [`HOST_READY`]
    state: CompletionState,
}

impl WatchList {
    /// Declares the modules to watch. Each gets its own bit after [`HOST_READY`].
    ///
    /// # Panics
    ///
    /// Panics if more than 31 modules are declared
    pub fn new(modules: &[(&'static str, &'static [&'static str])]) -> Self {
        assert!(modules.len() < 32, "completion mask only has 31 module bits");

        let modules: Vec<_> = modules
            .iter()
            .enumerate()
            .map(|(i, (identifier, paths))| WatchedModule {
                identifier,
                paths,
                bit: 1 << (i + 1),
                loaded: OnceLock::new(),
            })
            .collect();
        let everything = modules.iter().fold(HOST_READY, |mask, m| mask | m.bit);
        Self {
            modules,
            state: CompletionState::new(everything),
        }
    }

    /// Declared modules
    pub fn modules(&self) -> &[WatchedModule] {
        &self.modules
    }

    /// Completion mask
    pub fn state(&self) -> &CompletionState {
        &self.state
    }

    /// Looks up a declared module
    pub fn get(&self, identifier: &str) -> Option<&WatchedModule> {
        self.modules.iter().find(|m| m.identifier == identifier)
    }

    /// Records a load notification. Returns the module if it is watched; only the first
    /// notification's address and size are kept.
    pub fn record(
        &self,
        identifier: &str,
        id: ModuleId,
        address: usize,
        size: usize,
    ) -> Option<&WatchedModule> {
        let module = self.get(identifier)?;
        let _ = module.loaded.set(LoadedModule { id, address, size });
        Some(module)
    }

    /// Progress of the module called `identifier`
    pub fn module_state(&self, identifier: &str) -> Option<ModuleState> {
        let module = self.get(identifier)?;
        Some(if self.state.is_complete(module.bit) {
            ModuleState::ActionsComplete
        } else if self.state.is_claimed(module.bit) {
            ModuleState::ActionsPending
        } else if let Some(loaded) = module.loaded() {
            ModuleState::Seen {
                address: loaded.address,
                size: loaded.size,
            }
        } else {
            ModuleState::NotSeen
        })
    }
}
