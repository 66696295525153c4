use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DriverError, FieldError};
use crate::guest::{Guest, GuestAttr, GuestDirEntry, GuestFileKind, GuestFs, GuestIno};

const ACCEPTED_FIELDS: &[&str] = &["entries"];

/// Builds a [`Guest`] backed by a fixed, in-memory, content-addressed tree: the mount point
/// file's `"entries"` object maps a `/`-separated path to its literal file contents. There is no
/// network fetch and no cache; the whole tree is materialized at mount time, which is why this
/// driver exists mainly to exercise the mount subsystem end to end without needing a real
/// content-addressed store.
pub fn build(config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    let obj = config.as_object().ok_or_else(|| DriverError::InvalidConfig {
        driver: "keyfs".to_owned(),
        source: FieldError::new("<root>", ACCEPTED_FIELDS),
    })?;

    for key in obj.keys() {
        if !ACCEPTED_FIELDS.contains(&key.as_str()) {
            return Err(DriverError::InvalidConfig {
                driver: "keyfs".to_owned(),
                source: FieldError::new(key.clone(), ACCEPTED_FIELDS),
            });
        }
    }

    let entries_obj = obj
        .get("entries")
        .and_then(Value::as_object)
        .ok_or_else(|| DriverError::InvalidConfig {
            driver: "keyfs".to_owned(),
            source: FieldError::missing("entries"),
        })?;

    let mut entries = BTreeMap::new();
    for (path, value) in entries_obj {
        let content = value.as_str().ok_or_else(|| DriverError::InvalidConfig {
            driver: "keyfs".to_owned(),
            source: FieldError::new(format!("entries.{path}"), &[]),
        })?;
        entries.insert(path.trim_start_matches('/').to_owned(), content.as_bytes().to_vec());
    }

    Ok(Box::new(KeyfsGuest { entries }))
}

struct KeyfsGuest {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Guest for KeyfsGuest {
    fn make_fs(&self) -> Result<Arc<dyn GuestFs>, DriverError> {
        Ok(Arc::new(KeyfsFs::build(&self.entries)))
    }
}

struct KeyfsNode {
    kind: GuestFileKind,
    content: Vec<u8>,
    children: BTreeMap<String, GuestIno>,
}

/// A static tree materialized once at mount time from a flat path -> content map, the same way
/// a manifest-driven namespace turns a flat key list into a directory tree: walk each path's
/// components, creating an intermediate directory node wherever one doesn't exist yet.
struct KeyfsFs {
    nodes: Vec<KeyfsNode>,
}

impl KeyfsFs {
    fn build(entries: &BTreeMap<String, Vec<u8>>) -> Self {
        let mut nodes = vec![KeyfsNode {
            kind: GuestFileKind::Directory,
            content: Vec::new(),
            children: BTreeMap::new(),
        }];

        for (path, content) in entries {
            let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
            let mut current = 0usize;
            for (i, component) in components.iter().enumerate() {
                let is_last = i == components.len() - 1;
                let existing = nodes[current].children.get(*component).copied();
                current = match existing {
                    Some(ino) => (ino - 1) as usize,
                    None => {
                        let ino = nodes.len() as GuestIno + 1;
                        nodes.push(KeyfsNode {
                            kind: if is_last { GuestFileKind::File } else { GuestFileKind::Directory },
                            content: if is_last { content.clone() } else { Vec::new() },
                            children: BTreeMap::new(),
                        });
                        nodes[current].children.insert((*component).to_owned(), ino);
                        (ino - 1) as usize
                    }
                };
            }
        }

        Self { nodes }
    }

    fn node(&self, ino: GuestIno) -> Result<&KeyfsNode, DriverError> {
        self.nodes.get((ino - 1) as usize).ok_or_else(|| DriverError::NotFound(ino.to_string()))
    }

    fn attr(&self, ino: GuestIno) -> Result<GuestAttr, DriverError> {
        let node = self.node(ino)?;
        Ok(GuestAttr {
            ino,
            kind: node.kind,
            size: node.content.len() as u64,
            mtime: SystemTime::UNIX_EPOCH,
        })
    }
}

#[async_trait]
impl GuestFs for KeyfsFs {
    async fn lookup(&self, parent: GuestIno, name: &str) -> Result<GuestAttr, DriverError> {
        let parent_node = self.node(parent)?;
        let ino = *parent_node
            .children
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_owned()))?;
        self.attr(ino)
    }

    async fn getattr(&self, ino: GuestIno) -> Result<GuestAttr, DriverError> {
        self.attr(ino)
    }

    async fn readdir(&self, ino: GuestIno) -> Result<Vec<GuestDirEntry>, DriverError> {
        let node = self.node(ino)?;
        if node.kind != GuestFileKind::Directory {
            return Err(DriverError::NotADirectory(ino.to_string()));
        }
        Ok(node
            .children
            .iter()
            .map(|(name, &child_ino)| {
                let child = &self.nodes[(child_ino - 1) as usize];
                GuestDirEntry {
                    ino: child_ino,
                    name: name.clone(),
                    kind: child.kind,
                }
            })
            .collect())
    }

    async fn read(&self, ino: GuestIno, offset: u64, size: u32) -> Result<Vec<u8>, DriverError> {
        let node = self.node(ino)?;
        if node.kind == GuestFileKind::Directory {
            return Err(DriverError::NotADirectory(ino.to_string()));
        }
        let start = (offset as usize).min(node.content.len());
        let end = (start + size as usize).min(node.content.len());
        Ok(node.content[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GUEST_ROOT_INO;

    fn build_fs(entries: &[(&str, &str)]) -> KeyfsFs {
        let entries = entries.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect();
        KeyfsFs::build(&entries)
    }

    #[tokio::test]
    async fn builds_intermediate_directories() {
        let fs = build_fs(&[("a/b/c.txt", "hello")]);
        let a = fs.lookup(GUEST_ROOT_INO, "a").await.unwrap();
        assert_eq!(a.kind, GuestFileKind::Directory);
        let b = fs.lookup(a.ino, "b").await.unwrap();
        assert_eq!(b.kind, GuestFileKind::Directory);
        let c = fs.lookup(b.ino, "c.txt").await.unwrap();
        assert_eq!(c.kind, GuestFileKind::File);
        assert_eq!(c.size, 5);
    }

    #[tokio::test]
    async fn read_respects_offset_and_size() {
        let fs = build_fs(&[("f.txt", "hello world")]);
        let f = fs.lookup(GUEST_ROOT_INO, "f.txt").await.unwrap();
        let data = fs.read(f.ino, 6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn read_on_directory_is_an_error() {
        let fs = build_fs(&[("a/b.txt", "x")]);
        let a = fs.lookup(GUEST_ROOT_INO, "a").await.unwrap();
        assert!(matches!(fs.read(a.ino, 0, 10).await, Err(DriverError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn readdir_on_file_is_an_error() {
        let fs = build_fs(&[("f.txt", "x")]);
        let f = fs.lookup(GUEST_ROOT_INO, "f.txt").await.unwrap();
        assert!(matches!(fs.readdir(f.ino).await, Err(DriverError::NotADirectory(_))));
    }
}
