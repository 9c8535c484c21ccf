use super::{DialogId, DialogSetId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// The dialogs a single INVITE grew into, keyed by remote tag. A forking
/// proxy can split one request into any number of early dialogs; fork
/// policy (automatic acceptance, CANCEL-on-destroy, manual) is applied
/// over this set by the conversation layer.
pub struct DialogSet {
    pub id: DialogSetId,
    members: Mutex<HashMap<String, DialogId>>,
}

pub type DialogSetRef = Arc<DialogSet>;

impl DialogSet {
    pub fn new(id: DialogSetId) -> Self {
        DialogSet {
            id,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, remote_tag: &str, dialog_id: DialogId) {
        self.members
            .lock()
            .unwrap()
            .insert(remote_tag.to_string(), dialog_id);
    }

    pub fn get(&self, remote_tag: &str) -> Option<DialogId> {
        self.members.lock().unwrap().get(remote_tag).cloned()
    }

    pub fn remove(&self, remote_tag: &str) {
        self.members.lock().unwrap().remove(remote_tag);
    }

    pub fn dialog_ids(&self) -> Vec<DialogId> {
        self.members.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
