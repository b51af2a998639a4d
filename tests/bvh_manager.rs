use anyhow::Result;

use deimos::backend::headless::{HeadlessCommandStream, HeadlessDevice};
use deimos::{
    Arena, BvhManager, BvhManagerSettings, CommandStream, Device, Error, QueueType, SceneInstance, TransformMatrix,
};

mod framework;

fn frame<T>(device: &HeadlessDevice, record: impl FnOnce(&mut HeadlessCommandStream) -> Result<T>) -> Result<T> {
    let mut stream = device.create_command_stream(QueueType::Compute)?;
    let result = record(&mut stream)?;
    stream.close()?;
    stream.execute()?;
    device.wait_idle()?;
    Ok(result)
}

fn is_error(err: &anyhow::Error, check: impl FnOnce(&Error) -> bool) -> bool {
    err.downcast_ref::<Error>().is_some_and(check)
}

#[test]
pub fn geometry_is_deduplicated_by_key() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default());

    let first = manager.add_geometry("quad", vec![framework::quad(&device)?], 1)?;
    let second = manager.add_geometry("quad", vec![framework::quad_at(&device, 3.0)?], 4)?;
    assert_eq!(first, second, "Registering a key twice should return the same handle");
    assert_eq!(manager.geometry_count(), 1, "Only one geometry should be registered");
    assert_eq!(manager.pending_build_count(), 1, "Only one build should be queued");
    assert_eq!(manager.geometry(first)?.material_count(), 1, "The first registration wins");
    assert_eq!(manager.geometry(first)?.key(), "quad", "Key should be kept");

    let err = manager.add_geometry("empty", vec![], 1).expect_err("Geometry without descriptors should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidBuildInput(_))), "Expected invalid build input, got {err}");
    Ok(())
}

#[test]
pub fn builds_are_limited_per_frame() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default().max_build_per_frame(1));
    let handles = [
        manager.add_geometry("a", vec![framework::quad(&device)?], 1)?,
        manager.add_geometry("b", vec![framework::quad_at(&device, 1.0)?], 1)?,
        manager.add_geometry("c", vec![framework::aabb(&device, [0.0; 3], [1.0; 3])?], 1)?,
    ];

    for expected_pending in [2, 1, 0] {
        let built = frame(&device, |stream| manager.build_geometry(stream))?;
        assert_eq!(built, 1, "One build per frame");
        assert_eq!(manager.pending_build_count(), expected_pending, "Remaining builds are queued");
    }
    assert_eq!(frame(&device, |stream| manager.build_geometry(stream))?, 0, "Nothing left to build");

    for handle in handles {
        let geometry = manager.geometry(handle)?;
        assert!(geometry.is_built(), "Geometry {} should be built", geometry.key());
        assert!(!geometry.blas().is_scratch_shared(), "Builds should detach the shared scratch buffer");
    }
    assert!(manager.scratch_buffer().is_some(), "Builds should share one scratch buffer");
    Ok(())
}

#[test]
pub fn compaction_follows_the_delay() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default().compaction_delay(2));
    let handle = manager.add_geometry("quad", vec![framework::quad(&device)?], 1)?;

    assert_eq!(frame(&device, |stream| manager.build_geometry(stream))?, 1, "First frame builds");
    let built_size = manager.geometry(handle)?.blas().size();
    frame(&device, |stream| manager.build_geometry(stream))?;
    assert!(!manager.geometry(handle)?.is_compacted(), "Compaction waits for the delay");
    frame(&device, |stream| manager.build_geometry(stream))?;

    let geometry = manager.geometry(handle)?;
    assert!(geometry.is_compacted(), "Geometry should be compacted once the delay ran out");
    assert!(geometry.blas().size() <= built_size, "Compaction should not grow the structure");
    Ok(())
}

#[test]
pub fn scene_offsets_follow_material_counts() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default());
    let a = manager.add_geometry("a", vec![framework::quad(&device)?], 2)?;
    let b = manager.add_geometry("b", vec![framework::quad_at(&device, 1.0)?], 1)?;
    let c = manager.add_geometry("c", vec![framework::quad_at(&device, 2.0)?], 3)?;
    frame(&device, |stream| manager.build_geometry(stream))?;

    let instances = [
        SceneInstance::new(a),
        SceneInstance::new(b).id(5),
        SceneInstance::new(c).mask(0x0f),
        SceneInstance::new(a).transform(TransformMatrix::translation(0.0, 4.0, 0.0)),
    ];
    let scene = frame(&device, |stream| manager.build_scene(stream, &instances, 2))?.expect("All geometry is built");

    assert_eq!(scene.used_instances, vec![0, 1, 2, 3], "Every instance should be placed");
    assert_eq!(scene.hit_group_offsets, vec![0, 4, 6, 12], "Offsets count the materials placed before each instance");
    assert_eq!(Some(scene.address), manager.scene().address(), "Scene address is the top level structure");

    let buffer = manager.scene().buffer().cloned().expect("Scene was built");
    let records = device.top_level_instances(&buffer)?;
    let offsets = records.iter().map(|record| record.record_offset()).collect::<Vec<_>>();
    assert_eq!(offsets, vec![0, 4, 6, 12], "Instance records should carry the offsets");
    assert_eq!(records[1].instance_custom_index(), 5, "Instance id should be written");
    assert_eq!(records[2].instance_mask(), 0x0f, "Instance mask should be written");
    assert_eq!(
        records[3].reference(),
        manager.geometry(a)?.blas().address().unwrap_or_default(),
        "Instances reference their geometry"
    );
    Ok(())
}

#[test]
pub fn unbuilt_geometry_is_skipped() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default().max_build_per_frame(1));
    let a = manager.add_geometry("a", vec![framework::quad(&device)?], 3)?;
    let b = manager.add_geometry("b", vec![framework::quad_at(&device, 1.0)?], 1)?;

    let none = frame(&device, |stream| manager.build_scene(stream, &[SceneInstance::new(a)], 1))?;
    assert!(none.is_none(), "A scene without built geometry is empty");

    frame(&device, |stream| manager.build_geometry(stream))?;
    let instances = [SceneInstance::new(b), SceneInstance::new(a), SceneInstance::new(a)];
    let scene = frame(&device, |stream| manager.build_scene(stream, &instances, 1))?.expect("Geometry a is built");
    assert_eq!(scene.used_instances, vec![1, 2], "Instances of unbuilt geometry are skipped");
    assert_eq!(scene.hit_group_offsets, vec![0, 3], "Skipped instances take no hit groups");
    assert_eq!(manager.scene().instance_count(), 2, "Only placed instances are in the instance buffer");
    Ok(())
}

#[test]
pub fn removed_geometry_handles_go_stale() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = BvhManager::new(device.clone(), BvhManagerSettings::default());
    let a = manager.add_geometry("a", vec![framework::quad(&device)?], 1)?;
    let b = manager.add_geometry("b", vec![framework::quad_at(&device, 1.0)?], 1)?;
    frame(&device, |stream| manager.build_geometry(stream))?;

    let deferred = device.deferred_delete().len();
    manager.remove_geometry(a)?;
    assert!(device.deferred_delete().len() > deferred, "Removed structures go through deferred deletion");
    let err = manager.geometry(a).expect_err("Removed geometry should not be found");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidHandle)), "Expected invalid handle, got {err}");
    let err = manager.remove_geometry(a).expect_err("Geometry cannot be removed twice");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidHandle)), "Expected invalid handle, got {err}");

    let again = manager.add_geometry("a", vec![framework::quad(&device)?], 1)?;
    assert_ne!(again, a, "Re-registering a key gives a fresh handle");
    assert!(manager.geometry(a).is_err(), "The old handle stays stale after its slot is reused");

    let scene = frame(&device, |stream| manager.build_scene(stream, &[SceneInstance::new(a), SceneInstance::new(b)], 1))?
        .expect("Geometry b is built");
    assert_eq!(scene.used_instances, vec![1], "Instances of removed geometry are skipped");

    manager.destroy();
    assert_eq!(manager.geometry_count(), 0, "Destroy releases all geometry");
    assert!(manager.scene().address().is_none(), "Destroy releases the scene");
    Ok(())
}

#[test]
pub fn arena_handles() -> Result<()> {
    let mut arena = Arena::new();
    let one = arena.insert("one");
    let two = arena.insert("two");
    assert_eq!(arena.len(), 2, "Two entries");
    assert_eq!(*arena.get(two)?, "two", "Lookup by handle");

    assert_eq!(arena.remove(one)?, "one", "Remove returns the value");
    assert!(!arena.contains(one), "Removed handle is stale");
    let three = arena.insert("three");
    assert_eq!(three.index(), one.index(), "Freed slots are reused");
    assert_ne!(three.generation(), one.generation(), "Reused slots get a new generation");
    assert!(arena.get(one).is_err(), "Stale handle does not reach the new entry");
    *arena.get_mut(three)? = "THREE";
    assert_eq!(arena.iter().map(|(_, value)| *value).collect::<Vec<_>>(), vec!["THREE", "two"], "Iteration is in slot order");
    Ok(())
}
