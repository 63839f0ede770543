use chunk_store::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct Speed(f32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct Fuel(u32);

fn store_with(count: usize) -> Result<(EntityManager, ComponentGroup)> {
    let mut em = EntityManager::new();
    let arch = em.create_archetype(&[
        ComponentType::write::<Speed>(),
        ComponentType::write::<Fuel>(),
    ])?;
    em.create_entities(arch, count)?;
    let group = em.create_component_group(&[
        ComponentType::write::<Speed>(),
        ComponentType::read::<Fuel>(),
    ])?;
    Ok((em, group))
}

#[test]
fn test_view_invalidated_by_fence() -> Result<()> {
    let (em, group) = store_with(4)?;
    let speeds = group.component_data_array::<Speed>(&em)?;
    assert!(speeds.get(0).is_ok());

    em.tracker().complete_all_jobs_and_invalidate_arrays();
    assert!(matches!(speeds.get(0), Err(EcsError::SafetyViolation(_))));
    assert!(matches!(speeds.to_vec(), Err(EcsError::SafetyViolation(_))));

    let fresh = group.component_data_array::<Speed>(&em)?;
    assert_eq!(fresh.get(0)?, Speed(0.0));
    Ok(())
}

#[test]
fn test_writable_view_excludes_others() -> Result<()> {
    let (em, group) = store_with(4)?;
    let entity = group.entity_array(&em).get(0)?;

    let writer = group.component_data_array_mut::<Speed>(&em)?;
    assert!(matches!(
        group.component_data_array::<Speed>(&em),
        Err(EcsError::SafetyViolation(_))
    ));
    assert!(matches!(
        group.component_data_array_mut::<Speed>(&em),
        Err(EcsError::SafetyViolation(_))
    ));
    assert!(matches!(
        em.get_component::<Speed>(entity),
        Err(EcsError::SafetyViolation(_))
    ));
    // Other types are unaffected
    assert!(group.component_data_array::<Fuel>(&em).is_ok());
    drop(writer);

    let reader_a = group.component_data_array::<Speed>(&em)?;
    let reader_b = group.component_data_array::<Speed>(&em)?;
    assert!(group.component_data_array_mut::<Speed>(&em).is_err());
    drop(reader_a);
    drop(reader_b);
    assert!(group.component_data_array_mut::<Speed>(&em).is_ok());
    Ok(())
}

#[test]
fn test_group_dependencies_follow_access() -> Result<()> {
    let (mut em, writer_group) = store_with(1)?;
    let reader_group = em.create_component_group(&[ComponentType::read::<Speed>()])?;
    let fuel_group = em.create_component_group(&[ComponentType::read::<Fuel>()])?;

    let (job, finish) = JobHandle::pending();
    writer_group.add_dependency(&em, job);

    assert!(!reader_group.get_dependency(&em).is_completed());
    // Fuel is only read by the pending job
    assert!(fuel_group.get_dependency(&em).is_completed());
    assert!(em.tracker().has_pending(TypeRegistry::type_index::<Speed>()));

    finish.complete();
    assert!(reader_group.get_dependency(&em).is_completed());
    reader_group.complete_dependency(&em);
    Ok(())
}

#[cfg(feature = "parallel")]
#[test]
fn test_reader_job_runs_after_writer_job() -> Result<()> {
    let (em, _) = store_with(1)?;
    let speed = TypeRegistry::type_index::<Speed>();
    let clock = Arc::new(AtomicUsize::new(0));
    let writer_done_at = Arc::new(AtomicUsize::new(usize::MAX));
    let reader_started_at = Arc::new(AtomicUsize::new(usize::MAX));

    let (gate, open) = JobHandle::pending();
    let writer = {
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&writer_done_at);
        JobHandle::spawn(gate, move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            done.store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        })
    };
    em.tracker().add_dependency(&[], &[speed], writer.clone());

    let dependency = em.tracker().get_dependency(&[speed], &[]);
    assert!(!dependency.is_completed());
    let reader = {
        let clock = Arc::clone(&clock);
        let started = Arc::clone(&reader_started_at);
        JobHandle::spawn(dependency, move || {
            started.store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        })
    };
    em.tracker().add_dependency(&[speed], &[], reader.clone());

    open.complete();
    reader.complete();
    assert!(writer.is_completed());
    assert!(writer_done_at.load(Ordering::SeqCst) < reader_started_at.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_views_rejected_while_conflicting_job_pending() -> Result<()> {
    let (mut em, writer_group) = store_with(3)?;
    let speed_reader = em.create_component_group(&[ComponentType::read::<Speed>()])?;
    let fuel_writer = em.create_component_group(&[ComponentType::write::<Fuel>()])?;
    let entity = writer_group.entity_array(&em).get(0)?;

    let (job, finish) = JobHandle::pending();
    writer_group.add_dependency(&em, job);

    // Speed is written by the job, Fuel only read
    assert!(matches!(
        speed_reader.component_data_array::<Speed>(&em),
        Err(EcsError::SafetyViolation(_))
    ));
    assert!(matches!(
        writer_group.component_data_array_mut::<Speed>(&em),
        Err(EcsError::SafetyViolation(_))
    ));
    assert!(em.component_data_from_entity::<Speed>().is_err());
    assert!(speed_reader.for_each_chunk(&em, |_| {}).is_err());
    assert!(writer_group.component_data_array::<Fuel>(&em).is_ok());
    assert!(matches!(
        fuel_writer.component_data_array_mut::<Fuel>(&em),
        Err(EcsError::SafetyViolation(_))
    ));
    assert!(em.component_data_from_entity_mut::<Fuel>().is_err());

    finish.complete();
    assert_eq!(speed_reader.component_data_array::<Speed>(&em)?.get(0)?, Speed(0.0));
    assert!(fuel_writer.component_data_array_mut::<Fuel>(&em).is_ok());
    assert_eq!(em.get_component::<Speed>(entity)?, Speed(0.0));
    Ok(())
}

#[cfg(feature = "parallel")]
#[test]
fn test_scoped_jobs_follow_tracker_order() {
    use std::sync::atomic::AtomicU32;

    let tracker = DependencyTracker::new();
    let speed = TypeRegistry::type_index::<Speed>();
    let value = AtomicU32::new(0);
    let seen = AtomicU32::new(0);

    rayon::scope(|scope| {
        let (gate, open) = JobHandle::pending();
        let writer = JobHandle::spawn_in(scope, gate, || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            value.store(7, Ordering::SeqCst);
        });
        tracker.add_dependency(&[], &[speed], writer);
        assert!(tracker.check_readable(speed).is_err());

        let reader = JobHandle::spawn_in(scope, tracker.get_dependency(&[speed], &[]), || {
            seen.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        tracker.add_dependency(&[speed], &[], reader);
        open.complete();
    });

    assert_eq!(seen.load(Ordering::SeqCst), 7);
    assert!(!tracker.has_pending(speed));
    assert!(tracker.check_writable(speed).is_ok());
}

#[test]
fn test_structural_change_waits_for_jobs() -> Result<()> {
    let (mut em, group) = store_with(2)?;
    let entity = group.entity_array(&em).get(0)?;

    let (job, finish) = JobHandle::pending();
    group.add_dependency(&em, job.clone());
    let worker = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        finish.complete();
    });

    em.destroy_entity(entity)?;
    assert!(job.is_completed());
    worker.join().map_err(|_| EcsError::InvalidOperation("worker panicked".into()))?;
    Ok(())
}
