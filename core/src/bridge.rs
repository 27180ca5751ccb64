//! Abstract hardware control surface (spec.md §4.10, component C10).
//!
//! The concrete bridge (the real hardware control library) is an external
//! collaborator (spec.md §1); this module only specifies the operations it
//! must supply and the error set every call normalizes onto
//! ([`crate::error::BridgeError`]).

use crate::block::ConnType;
use crate::config::ImageKind;
use crate::error::BridgeError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// What `create` needs to stand up hardware for a block (spec.md §4.10).
#[derive(Debug, Clone)]
pub struct BlockDesc {
    pub mp_list: Vec<Vec<u32>>,
    pub conn_type: Vec<ConnType>,
    pub geo: Vec<u32>,
    pub start: Vec<u32>,
    /// Empty for a whole-midplane block.
    pub ionode_str: String,
}

/// Hardware-reported block state, as returned by `get_block_state`/
/// `get_blocks` and delivered by `subscribe` events. Distinct from
/// [`crate::block::BlockState`]: this is the bridge's own vocabulary, which
/// the state machine (C7) translates into the richer core state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwBlockState {
    Free,
    Booting,
    Inited,
    Rebooting,
    Term,
    Error,
}

#[derive(Debug, Clone)]
pub struct HwBlockInfo {
    pub block_id: String,
    pub state: HwBlockState,
    pub desc: BlockDesc,
}

/// Fields `modify` may update (spec.md §4.10: "for image fields").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyField {
    Image(ImageKind),
}

/// Asynchronous notifications delivered by `subscribe` (spec.md §5
/// event-listener thread).
#[derive(Debug, Clone)]
pub enum BlockEvent {
    StateChanged { block_id: String, state: HwBlockState },
    NodecardDown { mp_coord: Vec<u32>, nodecard: u32 },
    NodecardUp { mp_coord: Vec<u32>, nodecard: u32 },
    ComputeNodeFailed { mp_coord: Vec<u32>, cnode_start: usize, cnode_len: usize },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: BlockEvent);
}

/// The abstract bridge interface (spec.md §4.10). Every call may fail with
/// one of the [`BridgeError`] kinds; callers follow the retry policy in
/// spec.md §7 (`BUSY` retriable, `NOT_FOUND` after a free is success,
/// `INVALID_STATE` usually retriable unless the block is being destroyed).
pub trait Bridge: Send + Sync {
    fn create(&self, desc: &BlockDesc) -> BridgeResult<String>;
    fn boot(&self, block_id: &str) -> BridgeResult<()>;
    fn free(&self, block_id: &str) -> BridgeResult<()>;
    fn remove(&self, block_id: &str) -> BridgeResult<()>;
    fn add_user(&self, block_id: &str, user: &str) -> BridgeResult<()>;
    fn remove_user(&self, block_id: &str, user: &str) -> BridgeResult<()>;
    fn modify(&self, block_id: &str, field: ModifyField, value: &str) -> BridgeResult<()>;
    fn get_blocks(&self) -> BridgeResult<Vec<HwBlockInfo>>;
    fn get_block_state(&self, block_id: &str) -> BridgeResult<HwBlockState>;
    fn subscribe(&self, listener: Arc<dyn EventListener>) -> BridgeResult<()>;
}

/// An in-memory bridge double: stands in for the real hardware control
/// surface the way `bin/chainofcommand` stands in for a real boot
/// controller in the teacher repo. Used by `blockmgrd`'s demo harness and by
/// the state-machine/fault test suites, which otherwise have nothing to
/// drive `Bridge` calls against.
#[derive(Default)]
pub struct LoopbackBridge {
    blocks: Mutex<HashMap<String, HwBlockInfo>>,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
    next_id: Mutex<u64>,
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: BlockEvent) {
        for l in self.listeners.lock().unwrap().iter() {
            l.on_event(event.clone());
        }
    }

    /// Test/demo hook: force a block straight to a given state without
    /// going through `boot`/`free`, simulating an asynchronous hardware
    /// event delivered by the real bridge.
    pub fn force_state(&self, block_id: &str, state: HwBlockState) {
        if let Some(info) = self.blocks.lock().unwrap().get_mut(block_id) {
            info.state = state;
        }
        self.notify(BlockEvent::StateChanged {
            block_id: block_id.to_string(),
            state,
        });
    }
}

impl Bridge for LoopbackBridge {
    fn create(&self, desc: &BlockDesc) -> BridgeResult<String> {
        let mut blocks = self.blocks.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let block_id = format!("RMP{:04}", *next_id);
        blocks.insert(
            block_id.clone(),
            HwBlockInfo {
                block_id: block_id.clone(),
                state: HwBlockState::Free,
                desc: desc.clone(),
            },
        );
        Ok(block_id)
    }

    fn boot(&self, block_id: &str) -> BridgeResult<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let info = blocks.get_mut(block_id).ok_or(BridgeError::NotFound)?;
        info.state = HwBlockState::Inited;
        Ok(())
    }

    fn free(&self, block_id: &str) -> BridgeResult<()> {
        let mut blocks = self.blocks.lock().unwrap();
        match blocks.get_mut(block_id) {
            Some(info) => {
                info.state = HwBlockState::Free;
                Ok(())
            }
            // spec.md §7: NOT_FOUND after a free is success.
            None => Ok(()),
        }
    }

    fn remove(&self, block_id: &str) -> BridgeResult<()> {
        self.blocks.lock().unwrap().remove(block_id);
        Ok(())
    }

    fn add_user(&self, block_id: &str, _user: &str) -> BridgeResult<()> {
        if self.blocks.lock().unwrap().contains_key(block_id) {
            Ok(())
        } else {
            Err(BridgeError::NotFound)
        }
    }

    fn remove_user(&self, block_id: &str, _user: &str) -> BridgeResult<()> {
        if self.blocks.lock().unwrap().contains_key(block_id) {
            Ok(())
        } else {
            Err(BridgeError::NotFound)
        }
    }

    fn modify(&self, block_id: &str, _field: ModifyField, _value: &str) -> BridgeResult<()> {
        if self.blocks.lock().unwrap().contains_key(block_id) {
            Ok(())
        } else {
            Err(BridgeError::NotFound)
        }
    }

    fn get_blocks(&self) -> BridgeResult<Vec<HwBlockInfo>> {
        Ok(self.blocks.lock().unwrap().values().cloned().collect())
    }

    fn get_block_state(&self, block_id: &str) -> BridgeResult<HwBlockState> {
        self.blocks
            .lock()
            .unwrap()
            .get(block_id)
            .map(|i| i.state)
            .ok_or(BridgeError::NotFound)
    }

    fn subscribe(&self, listener: Arc<dyn EventListener>) -> BridgeResult<()> {
        self.listeners.lock().unwrap().push(listener);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> BlockDesc {
        BlockDesc {
            mp_list: vec![vec![0, 0, 0]],
            conn_type: vec![ConnType::Mesh, ConnType::Mesh, ConnType::Mesh],
            geo: vec![1, 1, 1],
            start: vec![0, 0, 0],
            ionode_str: String::new(),
        }
    }

    #[test]
    fn create_then_boot_then_free_round_trips_state() {
        let bridge = LoopbackBridge::new();
        let id = bridge.create(&desc()).unwrap();
        assert_eq!(bridge.get_block_state(&id).unwrap(), HwBlockState::Free);
        bridge.boot(&id).unwrap();
        assert_eq!(bridge.get_block_state(&id).unwrap(), HwBlockState::Inited);
        bridge.free(&id).unwrap();
        assert_eq!(bridge.get_block_state(&id).unwrap(), HwBlockState::Free);
    }

    #[test]
    fn free_after_remove_is_not_found_but_free_of_unknown_id_is_success() {
        let bridge = LoopbackBridge::new();
        assert!(matches!(
            bridge.get_block_state("missing"),
            Err(BridgeError::NotFound)
        ));
        assert!(bridge.free("missing").is_ok());
    }
}
