//! Name → id indirection for folders and projects.
//!
//! The registry is the only place that knows item names. Renames and moves
//! rewrite entries here and nowhere else.

use buildit_core::{Error, FullName, ItemKind, ResourceId, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::storage::{read_json, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ResourceId,
    pub kind: ItemKind,
    pub name: FullName,
}

/// An item whose name changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub id: ResourceId,
    pub kind: ItemKind,
    pub from: FullName,
    pub to: FullName,
}

pub struct ItemRegistry {
    path: PathBuf,
    items: RwLock<BTreeMap<FullName, ItemRecord>>,
}

impl ItemRegistry {
    /// Load the registry persisted at `path`, or start empty.
    pub fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<ItemRecord> = read_json(&path)?.unwrap_or_default();
        let items = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    pub fn lookup(&self, name: &FullName) -> Option<ItemRecord> {
        self.items.read().get(name).cloned()
    }

    pub fn name_of(&self, id: ResourceId) -> Option<FullName> {
        self.items
            .read()
            .values()
            .find(|record| record.id == id)
            .map(|record| record.name.clone())
    }

    pub fn all(&self) -> Vec<ItemRecord> {
        self.items.read().values().cloned().collect()
    }

    /// Direct children of `parent`, or top-level items.
    pub fn children(&self, parent: Option<&FullName>) -> Vec<ItemRecord> {
        self.items
            .read()
            .values()
            .filter(|record| record.name.parent().as_ref() == parent)
            .cloned()
            .collect()
    }

    pub fn create(&self, name: FullName, kind: ItemKind) -> Result<ResourceId> {
        let mut items = self.items.write();
        if items.contains_key(&name) {
            return Err(Error::Conflict(format!("an item named '{name}' already exists")));
        }
        check_parent(&items, name.parent().as_ref())?;

        let id = ResourceId::new();
        let mut next = items.clone();
        next.insert(name.clone(), ItemRecord { id, kind, name: name.clone() });
        self.persist(&next)?;
        *items = next;
        info!(item = %name, %id, ?kind, "Created item");
        Ok(id)
    }

    /// Give an item a new name within its current folder.
    pub fn rename(&self, name: &FullName, new_name: &str) -> Result<Vec<Renamed>> {
        let to = FullName::within(name.parent().as_ref(), new_name)?;
        self.relocate(name, to)
    }

    /// Move an item into another folder, or to the top level.
    pub fn move_item(&self, name: &FullName, folder: Option<&FullName>) -> Result<Vec<Renamed>> {
        let to = FullName::within(folder, name.name())?;
        self.relocate(name, to)
    }

    fn relocate(&self, from: &FullName, to: FullName) -> Result<Vec<Renamed>> {
        let mut items = self.items.write();
        if !items.contains_key(from) {
            return Err(Error::NotFound(format!("no such item: {from}")));
        }
        if *from == to {
            return Ok(Vec::new());
        }
        if items.contains_key(&to) {
            return Err(Error::Conflict(format!("an item named '{to}' already exists")));
        }
        if to.is_within(from) {
            return Err(Error::InvalidInput(format!("cannot move '{from}' into itself")));
        }
        check_parent(&items, to.parent().as_ref())?;

        let affected: Vec<FullName> = items
            .keys()
            .filter(|name| name.is_within(from))
            .cloned()
            .collect();
        let mut next = items.clone();
        let mut renamed = Vec::with_capacity(affected.len());
        for old in affected {
            let Some(mut record) = next.remove(&old) else {
                continue;
            };
            let Some(new) = old.rebase(from, &to) else {
                continue;
            };
            record.name = new.clone();
            renamed.push(Renamed {
                id: record.id,
                kind: record.kind,
                from: old,
                to: new.clone(),
            });
            next.insert(new, record);
        }
        self.persist(&next)?;
        *items = next;
        info!(from = %from, to = %to, items = renamed.len(), "Relocated item");
        Ok(renamed)
    }

    /// Remove an item and everything below it.
    pub fn remove(&self, name: &FullName) -> Result<Vec<ItemRecord>> {
        let mut items = self.items.write();
        if !items.contains_key(name) {
            return Err(Error::NotFound(format!("no such item: {name}")));
        }
        let doomed: Vec<FullName> = items
            .keys()
            .filter(|candidate| candidate.is_within(name))
            .cloned()
            .collect();
        let mut next = items.clone();
        let removed: Vec<ItemRecord> = doomed
            .iter()
            .filter_map(|candidate| next.remove(candidate))
            .collect();
        self.persist(&next)?;
        *items = next;
        info!(item = %name, items = removed.len(), "Removed item");
        Ok(removed)
    }

    /// The existing name closest to `name`, for "did you mean" hints.
    pub fn suggest(&self, name: &str) -> Option<FullName> {
        self.items
            .read()
            .keys()
            .map(|candidate| (edit_distance(name, candidate.as_str()), candidate))
            .min_by_key(|(distance, _)| *distance)
            .filter(|(distance, _)| *distance <= name.chars().count().max(1))
            .map(|(_, candidate)| candidate.clone())
    }

    fn persist(&self, items: &BTreeMap<FullName, ItemRecord>) -> Result<()> {
        let records: Vec<&ItemRecord> = items.values().collect();
        write_json_atomic(&self.path, &records)
    }
}

fn check_parent(items: &BTreeMap<FullName, ItemRecord>, parent: Option<&FullName>) -> Result<()> {
    let Some(parent) = parent else {
        return Ok(());
    };
    match items.get(parent) {
        Some(record) if record.kind == ItemKind::Folder => Ok(()),
        Some(_) => Err(Error::InvalidInput(format!("'{parent}' is not a folder"))),
        None => Err(Error::NotFound(format!("no such folder: {parent}"))),
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            row[j + 1] = substitution.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}
