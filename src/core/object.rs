//! Object registry
//!
//! Owns every session object (input and output endpoints) and every I/O
//! handle opened on them. Sharing is enforced per object the way a file
//! system enforces share modes: each object keeps counters of how many
//! openers read, write, and allow others to read or write.

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;

use super::status::{ConsoleError, Result};
use crate::platform::RawHandle;

bitflags! {
    /// Desired access on an I/O handle
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const GENERIC_READ  = 0x8000_0000;
        const GENERIC_WRITE = 0x4000_0000;
    }
}

bitflags! {
    /// Access other openers may be granted concurrently
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShareMode: u32 {
        const READ  = 0x0000_0001;
        const WRITE = 0x0000_0002;
    }
}

impl AccessMask {
    /// Read and write, the access every connecting process gets
    pub const READ_WRITE: AccessMask = AccessMask::GENERIC_READ.union(AccessMask::GENERIC_WRITE);
}

impl ShareMode {
    pub const ALL: ShareMode = ShareMode::READ.union(ShareMode::WRITE);
}

/// Identifier of a session object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Identifier of an open I/O handle; doubles as the token published to the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Character-cell dimensions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Size {
    pub width: u16,
    pub height: u16,
}

impl Size {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Input side of the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputEndpoint {
    /// Event signaled when input arrives
    pub wake_event: RawHandle,
}

/// An output (screen) buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputEndpoint {
    pub buffer_size: Size,
    pub window_size: Size,
}

/// Closed set of session object kinds
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Input(InputEndpoint),
    Output(OutputEndpoint),
}

/// Kind of a handle, derived from the object it was opened on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Input,
    Output,
}

impl Endpoint {
    pub fn handle_kind(&self) -> HandleKind {
        match self {
            Endpoint::Input(_) => HandleKind::Input,
            Endpoint::Output(_) => HandleKind::Output,
        }
    }
}

/// Sharing counters of one object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    pub open_count: u32,
    pub reader_count: u32,
    pub writer_count: u32,
    pub read_share_count: u32,
    pub write_share_count: u32,
}

impl ObjectHeader {
    /// Whether a new opener with this access and share mode is compatible
    fn permits(&self, access: AccessMask, share: ShareMode) -> bool {
        if access.contains(AccessMask::GENERIC_READ) && self.read_share_count != self.open_count {
            return false;
        }
        if access.contains(AccessMask::GENERIC_WRITE) && self.write_share_count != self.open_count {
            return false;
        }
        if !share.contains(ShareMode::READ) && self.reader_count > 0 {
            return false;
        }
        if !share.contains(ShareMode::WRITE) && self.writer_count > 0 {
            return false;
        }
        true
    }

    fn add(&mut self, access: AccessMask, share: ShareMode) {
        self.open_count += 1;
        if access.contains(AccessMask::GENERIC_READ) {
            self.reader_count += 1;
        }
        if access.contains(AccessMask::GENERIC_WRITE) {
            self.writer_count += 1;
        }
        if share.contains(ShareMode::READ) {
            self.read_share_count += 1;
        }
        if share.contains(ShareMode::WRITE) {
            self.write_share_count += 1;
        }
    }

    fn remove(&mut self, access: AccessMask, share: ShareMode) {
        self.open_count = self.open_count.saturating_sub(1);
        if access.contains(AccessMask::GENERIC_READ) {
            self.reader_count = self.reader_count.saturating_sub(1);
        }
        if access.contains(AccessMask::GENERIC_WRITE) {
            self.writer_count = self.writer_count.saturating_sub(1);
        }
        if share.contains(ShareMode::READ) {
            self.read_share_count = self.read_share_count.saturating_sub(1);
        }
        if share.contains(ShareMode::WRITE) {
            self.write_share_count = self.write_share_count.saturating_sub(1);
        }
    }
}

/// A session object and its sharing state
#[derive(Debug)]
pub struct SessionObject {
    pub endpoint: Endpoint,
    pub header: ObjectHeader,
    /// Held by the session itself; survives its last handle
    pinned: bool,
}

impl SessionObject {
    #[cfg(test)]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// An open handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoHandle {
    pub object: ObjectId,
    pub kind: HandleKind,
    pub access: AccessMask,
    pub share: ShareMode,
}

/// Registry of session objects and the handles opened on them
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<ObjectId, SessionObject>,
    handles: HashMap<HandleId, IoHandle>,
    next_object: u64,
    next_handle: u64,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object. Pinned objects live until `unpin`, regardless of handles.
    pub fn create_object(&mut self, endpoint: Endpoint, pinned: bool) -> ObjectId {
        self.next_object += 1;
        let id = ObjectId(self.next_object);
        self.objects.insert(
            id,
            SessionObject {
                endpoint,
                header: ObjectHeader::default(),
                pinned,
            },
        );
        id
    }

    /// Release the session's hold; the object goes away now if nothing else has it open.
    pub fn unpin(&mut self, id: ObjectId) {
        let destroy = match self.objects.get_mut(&id) {
            Some(object) => {
                object.pinned = false;
                object.header.open_count == 0
            }
            None => false,
        };
        if destroy {
            self.objects.remove(&id);
        }
    }

    /// Open a handle on `object` with the given access and share mode
    pub fn allocate_handle(
        &mut self,
        object: ObjectId,
        access: AccessMask,
        share: ShareMode,
    ) -> Result<HandleId> {
        let target = self
            .objects
            .get_mut(&object)
            .ok_or(ConsoleError::Validation("object does not exist"))?;

        if !target.header.permits(access, share) {
            return Err(ConsoleError::AccessConflict(object.0));
        }
        target.header.add(access, share);
        let kind = target.endpoint.handle_kind();

        self.next_handle += 1;
        let id = HandleId(self.next_handle);
        self.handles.insert(
            id,
            IoHandle {
                object,
                kind,
                access,
                share,
            },
        );
        Ok(id)
    }

    /// Close a handle. The object is destroyed with its last handle unless pinned.
    pub fn free_handle(&mut self, id: HandleId) -> Result<IoHandle> {
        let handle = self
            .handles
            .remove(&id)
            .ok_or(ConsoleError::InvalidHandle(id.0))?;

        let destroy = match self.objects.get_mut(&handle.object) {
            Some(object) => {
                object.header.remove(handle.access, handle.share);
                object.header.open_count == 0 && !object.pinned
            }
            None => false,
        };
        if destroy {
            self.objects.remove(&handle.object);
        }
        Ok(handle)
    }

    pub fn object(&self, id: ObjectId) -> Option<&SessionObject> {
        self.objects.get(&id)
    }

    #[cfg(test)]
    pub fn handle(&self, id: HandleId) -> Option<&IoHandle> {
        self.handles.get(&id)
    }

    /// Number of open handles on `id`
    #[cfg(test)]
    pub fn open_count(&self, id: ObjectId) -> Option<u32> {
        self.objects.get(&id).map(|o| o.header.open_count)
    }

    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> Endpoint {
        Endpoint::Output(OutputEndpoint {
            buffer_size: Size::new(80, 300),
            window_size: Size::new(80, 25),
        })
    }

    #[test]
    fn test_allocate_increments_open_count() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);

        let h = registry
            .allocate_handle(obj, AccessMask::READ_WRITE, ShareMode::ALL)
            .unwrap();

        assert_eq!(registry.open_count(obj), Some(1));
        assert_eq!(registry.handle(h).unwrap().kind, HandleKind::Output);
        assert_eq!(registry.handle_count(), 1);
    }

    #[test]
    fn test_exclusive_reader_blocks_second_reader() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);

        registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::empty())
            .unwrap();

        let err = registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::ALL)
            .unwrap_err();
        assert_eq!(err, ConsoleError::AccessConflict(obj.0));
        assert_eq!(registry.open_count(obj), Some(1));
    }

    #[test]
    fn test_deny_write_share_with_existing_writer() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);

        registry
            .allocate_handle(obj, AccessMask::GENERIC_WRITE, ShareMode::ALL)
            .unwrap();

        // Asking to be the only writer while a writer exists
        let err = registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::READ)
            .unwrap_err();
        assert!(matches!(err, ConsoleError::AccessConflict(_)));
    }

    #[test]
    fn test_close_then_reopen_restores_sharing() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);

        let h = registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::empty())
            .unwrap();
        let before = registry.object(obj).unwrap().header;

        registry.free_handle(h).unwrap();
        assert_eq!(registry.object(obj).unwrap().header, ObjectHeader::default());

        registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::empty())
            .unwrap();
        assert_eq!(registry.object(obj).unwrap().header, before);
    }

    #[test]
    fn test_unpinned_object_dies_with_last_handle() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), false);

        let a = registry
            .allocate_handle(obj, AccessMask::READ_WRITE, ShareMode::ALL)
            .unwrap();
        let b = registry
            .allocate_handle(obj, AccessMask::GENERIC_READ, ShareMode::ALL)
            .unwrap();

        registry.free_handle(a).unwrap();
        assert!(registry.object(obj).is_some());
        registry.free_handle(b).unwrap();
        assert!(registry.object(obj).is_none());
    }

    #[test]
    fn test_pinned_object_survives_and_unpin_destroys() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);
        let h = registry
            .allocate_handle(obj, AccessMask::READ_WRITE, ShareMode::ALL)
            .unwrap();

        registry.free_handle(h).unwrap();
        assert!(registry.object(obj).is_some());

        registry.unpin(obj);
        assert!(registry.object(obj).is_none());
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut registry = ObjectRegistry::new();
        let obj = registry.create_object(output(), true);
        let h = registry
            .allocate_handle(obj, AccessMask::READ_WRITE, ShareMode::ALL)
            .unwrap();

        registry.free_handle(h).unwrap();
        assert_eq!(registry.free_handle(h), Err(ConsoleError::InvalidHandle(h.0)));
        assert_eq!(registry.open_count(obj), Some(0));
    }
}
