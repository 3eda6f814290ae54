//! GC 协作单元测试
//!
//! 测试 pin 计数、回收请求和不可达对象判定

use crate::object::{NewObject, Object, ObjectFlags, ObjectHandle, ObjectTable};
use crate::runtime::gc::{GCState, GarbageCollector, NoCollector, TrackingCollector};

fn object(
    name: &str,
    outer: Option<ObjectHandle>,
) -> ObjectHandle {
    Object::new(NewObject {
        outer,
        ..NewObject::named(name)
    })
}

#[cfg(test)]
mod pin_tests {
    use super::*;

    #[test]
    fn test_pin_and_unpin() {
        let gc = TrackingCollector::new();
        let obj = object("/Game/Foo", None);
        gc.pin(&obj);
        gc.pin(&obj);
        assert_eq!(gc.pin_count(&obj), 2);
        gc.unpin(&obj);
        assert!(gc.is_pinned(&obj));
        gc.unpin(&obj);
        assert!(!gc.is_pinned(&obj));
        assert_eq!(gc.total_pins(), 0);
    }

    #[test]
    fn test_unbalanced_unpin_is_ignored() {
        let gc = TrackingCollector::new();
        let obj = object("/Game/Foo", None);
        gc.unpin(&obj);
        assert_eq!(gc.pin_count(&obj), 0);
    }

    #[test]
    fn test_no_collector() {
        let gc = NoCollector;
        let obj = object("/Game/Foo", None);
        gc.pin(&obj);
        gc.create_cluster(&obj);
        assert!(!gc.is_collection_requested());
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;

    #[test]
    fn test_request_cycle() {
        let gc = TrackingCollector::new();
        assert_eq!(gc.state(), GCState::Idle);
        gc.request_collection();
        assert!(gc.is_collection_requested());
        assert_eq!(gc.state(), GCState::Requested);
        gc.begin_sweep();
        assert_eq!(gc.state(), GCState::Sweeping);
        gc.finish_collection();
        assert!(!gc.is_collection_requested());
        assert_eq!(gc.state(), GCState::Idle);
    }

    #[test]
    fn test_pinned_root_keeps_package_reachable() {
        let gc = TrackingCollector::new();
        let table = ObjectTable::new();
        let root = table.insert_or_get(object("/Game/Foo", None));
        let child = table.insert_or_get(object("Mesh", Some(root.clone())));
        let native = object("/Script/Core.Blob", None);
        native.set_flags(ObjectFlags::NATIVE);
        table.insert_or_get(native);

        gc.pin(&root);
        assert!(gc.unreachable_objects(&table).is_empty());

        gc.unpin(&root);
        let unreachable = gc.unreachable_objects(&table);
        assert_eq!(unreachable.len(), 2);
        assert!(unreachable.iter().any(|o| o.id() == child.id()));
    }

    #[test]
    fn test_clusters_are_recorded() {
        let gc = TrackingCollector::new();
        let root = object("/Game/Foo", None);
        gc.create_cluster(&root);
        assert_eq!(gc.clusters(), vec![root.id()]);
    }
}
