use std::io::Read;

use crate::digest::ContentDigest;
use crate::domain::{ContainerRef, ObjectId, RemoteObject};
use crate::error::IngestError;

pub type ObjectIter<'a> = Box<dyn Iterator<Item = Result<RemoteObject, IngestError>> + 'a>;

pub struct FetchedObject {
    pub reader: Box<dyn Read + Send>,
    pub digest_hint: Option<ContentDigest>,
}

impl FetchedObject {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            digest_hint: None,
        }
    }

    pub fn with_digest_hint(mut self, digest: Option<ContentDigest>) -> Self {
        self.digest_hint = digest;
        self
    }
}

/// Narrow capability interface implemented once per remote source.
///
/// Every error an adapter returns is treated as transient by the pipeline;
/// retrying is the orchestrator's job.
pub trait RemoteAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    /// Lists the objects of one container. The iterator is finite and may be
    /// restarted by calling `enumerate` again.
    fn enumerate<'a>(&'a self, container: &ContainerRef) -> Result<ObjectIter<'a>, IngestError>;

    fn fetch(&self, object: &RemoteObject) -> Result<FetchedObject, IngestError>;

    /// Current metadata for one object, `None` if it no longer exists.
    fn metadata(&self, id: &ObjectId) -> Result<Option<RemoteObject>, IngestError>;

    fn supports_delete(&self) -> bool {
        false
    }

    fn delete(&self, _object: &RemoteObject) -> Result<(), IngestError> {
        Err(IngestError::DeleteUnsupported(self.source_name().to_string()))
    }
}
