//! Loaded object model
//!
//! Objects are shared through [`ObjectHandle`]; their per-class state lives
//! in a boxed [`ObjectBody`] behind a mutex. Classes are ordinary objects
//! that carry a [`ClassInfo`].

pub mod builtin;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::package::archive::ExportArchive;
use crate::package::error::ArchiveError;

bitflags! {
    /// Object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        const PUBLIC = 1 << 0;
        const STANDALONE = 1 << 1;
        const NATIVE = 1 << 2;
        const NEED_LOAD = 1 << 3;
        const NEED_POST_LOAD = 1 << 4;
        const WAS_LOADED = 1 << 5;
        const LOAD_COMPLETED = 1 << 6;
        const ASYNC_LOADING = 1 << 7;
        const PACKAGE_ROOT = 1 << 8;

        /// Flags owned by the loader while an object is in flight.
        const TRANSIENT_LOAD = Self::NEED_LOAD.bits()
            | Self::NEED_POST_LOAD.bits()
            | Self::ASYNC_LOADING.bits();
    }
}

bitflags! {
    /// Per-export runtime filter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExportFilterFlags: u8 {
        const NOT_FOR_CLIENT = 1 << 0;
        const NOT_FOR_SERVER = 1 << 1;
    }
}

/// Unique object id, assigned at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ObjectId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Class-specific object state.
///
/// `serialize` must consume exactly the bytes the export declared; the
/// archive refuses to read past them.
pub trait ObjectBody: Send + 'static {
    fn serialize(
        &mut self,
        archive: &mut ExportArchive<'_>,
    ) -> Result<(), ArchiveError> {
        let _ = archive;
        Ok(())
    }

    fn post_load(&mut self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Body for objects without state of their own
#[derive(Debug, Default)]
pub struct EmptyBody;

impl ObjectBody for EmptyBody {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type ObjectFactory = Arc<dyn Fn() -> Box<dyn ObjectBody> + Send + Sync>;

/// Runtime description of a class
pub struct ClassInfo {
    name: String,
    thread_safe_post_load: bool,
    factory: ObjectFactory,
}

impl ClassInfo {
    pub fn new<F>(
        name: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn ObjectBody> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            thread_safe_post_load: false,
            factory: Arc::new(factory),
        }
    }

    /// Declare that `post_load` may run on any loader thread.
    pub fn thread_safe_post_load(
        mut self,
        thread_safe: bool,
    ) -> Self {
        self.thread_safe_post_load = thread_safe;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_post_load_thread_safe(&self) -> bool {
        self.thread_safe_post_load
    }

    pub fn instantiate(&self) -> Box<dyn ObjectBody> {
        (self.factory)()
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("thread_safe_post_load", &self.thread_safe_post_load)
            .finish()
    }
}

pub type ObjectHandle = Arc<Object>;

/// Construction parameters for [`Object::new`]
pub struct NewObject {
    pub name: String,
    pub outer: Option<ObjectHandle>,
    pub class: Option<ObjectHandle>,
    pub super_struct: Option<ObjectHandle>,
    pub template: Option<ObjectHandle>,
    pub flags: ObjectFlags,
    pub class_info: Option<Arc<ClassInfo>>,
    pub body: Box<dyn ObjectBody>,
}

impl NewObject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outer: None,
            class: None,
            super_struct: None,
            template: None,
            flags: ObjectFlags::empty(),
            class_info: None,
            body: Box::new(EmptyBody),
        }
    }
}

pub struct Object {
    id: ObjectId,
    name: String,
    path: String,
    outer: Option<ObjectHandle>,
    class: Option<ObjectHandle>,
    super_struct: Option<ObjectHandle>,
    template: Option<ObjectHandle>,
    class_info: Option<Arc<ClassInfo>>,
    flags: AtomicU32,
    body: Mutex<Box<dyn ObjectBody>>,
}

impl Object {
    pub fn new(desc: NewObject) -> ObjectHandle {
        let path = match &desc.outer {
            Some(outer) => child_path(outer, &desc.name),
            None => desc.name.clone(),
        };
        Arc::new(Self {
            id: ObjectId::next(),
            name: desc.name,
            path,
            outer: desc.outer,
            class: desc.class,
            super_struct: desc.super_struct,
            template: desc.template,
            class_info: desc.class_info,
            flags: AtomicU32::new(desc.flags.bits()),
            body: Mutex::new(desc.body),
        })
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path, e.g. `/Game/Foo.Mesh:Section0`
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn outer(&self) -> Option<&ObjectHandle> {
        self.outer.as_ref()
    }

    #[inline]
    pub fn class(&self) -> Option<&ObjectHandle> {
        self.class.as_ref()
    }

    #[inline]
    pub fn super_struct(&self) -> Option<&ObjectHandle> {
        self.super_struct.as_ref()
    }

    #[inline]
    pub fn template(&self) -> Option<&ObjectHandle> {
        self.template.as_ref()
    }

    /// Present when this object is itself a class
    #[inline]
    pub fn class_info(&self) -> Option<&Arc<ClassInfo>> {
        self.class_info.as_ref()
    }

    #[inline]
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_any_flags(
        &self,
        flags: ObjectFlags,
    ) -> bool {
        self.flags().intersects(flags)
    }

    pub fn set_flags(
        &self,
        flags: ObjectFlags,
    ) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(
        &self,
        flags: ObjectFlags,
    ) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// The package root this object lives in
    pub fn package_root(&self) -> Option<&ObjectHandle> {
        let mut current = self.outer.as_ref()?;
        while let Some(next) = current.outer.as_ref() {
            current = next;
        }
        Some(current)
    }

    /// Whether this object's class allows post-load off the consuming thread
    pub fn post_load_is_thread_safe(&self) -> bool {
        self.class
            .as_ref()
            .and_then(|class| class.class_info.as_ref())
            .is_some_and(|info| info.is_post_load_thread_safe())
    }

    /// Run `f` with exclusive access to the body.
    ///
    /// The body lock is held for the duration; `f` must not reenter this object.
    pub fn with_body<R>(
        &self,
        f: impl FnOnce(&mut dyn ObjectBody) -> R,
    ) -> R {
        let mut body = self.body.lock();
        f(body.as_mut())
    }

    /// Read the body as a concrete type
    pub fn body_as<T: 'static, R>(
        &self,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let body = self.body.lock();
        body.as_any().downcast_ref::<T>().map(f)
    }
}

impl fmt::Debug for Object {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &self.flags())
            .finish()
    }
}

fn child_path(
    outer: &Object,
    name: &str,
) -> String {
    // Top-level exports hang off the package with '.', subobjects with ':'
    let separator = if outer.outer.is_none() { '.' } else { ':' };
    format!("{}{}{}", outer.path, separator, name)
}

/// Path a child named `name` of `outer` would get
pub fn path_for(
    outer: Option<&Object>,
    name: &str,
) -> String {
    match outer {
        Some(outer) => child_path(outer, name),
        None => name.to_string(),
    }
}

/// Case-insensitive path index over live objects
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: RwLock<HashMap<String, ObjectHandle>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(
        &self,
        path: &str,
    ) -> Option<ObjectHandle> {
        self.objects.read().get(&path.to_lowercase()).cloned()
    }

    /// Insert unless an object already lives at that path; returns the
    /// object that ends up in the table.
    pub fn insert_or_get(
        &self,
        object: ObjectHandle,
    ) -> ObjectHandle {
        let mut objects = self.objects.write();
        objects
            .entry(object.path().to_lowercase())
            .or_insert(object)
            .clone()
    }

    /// Remove `object` if it is the entry at its path
    pub fn remove(
        &self,
        object: &Object,
    ) -> bool {
        let key = object.path().to_lowercase();
        let mut objects = self.objects.write();
        match objects.get(&key) {
            Some(existing) if existing.id() == object.id() => {
                objects.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(
        &self,
        object: &Object,
    ) -> bool {
        self.objects
            .read()
            .get(&object.path().to_lowercase())
            .is_some_and(|existing| existing.id() == object.id())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }

    /// Snapshot of every live object
    pub fn objects(&self) -> Vec<ObjectHandle> {
        self.objects.read().values().cloned().collect()
    }
}
