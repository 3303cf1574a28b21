//! Storage collaborator: opens HEX images by name.
//!
//! Closing an image is dropping its reader.

use crate::error::{Error, Result};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};

/// Source of named HEX images.
pub trait ImageStore {
    /// Sequential reader over one open image.
    type Reader: BufRead;

    /// Open `name`. Names are passed through verbatim.
    fn open(&self, name: &str) -> Result<Self::Reader>;
}

/// Images stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageStore for DirStore {
    type Reader = BufReader<File>;

    fn open(&self, name: &str) -> Result<Self::Reader> {
        let path = self.root.join(name);
        match File::open(&path) {
            Ok(file) => {
                debug!("Opened image {}", path.display());
                Ok(BufReader::new(file))
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::ImageNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Named images held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    images: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an image.
    pub fn insert(&mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.images.insert(name.into(), contents.into());
    }

    /// Builder form of [`MemoryStore::insert`].
    #[must_use]
    pub fn with_image(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(name, contents);
        self
    }
}

impl ImageStore for MemoryStore {
    type Reader = Cursor<Vec<u8>>;

    fn open(&self, name: &str) -> Result<Self::Reader> {
        self.images
            .get(name)
            .map(|contents| Cursor::new(contents.clone()))
            .ok_or_else(|| Error::ImageNotFound {
                name: name.to_string(),
            })
    }
}
