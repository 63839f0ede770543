//! Writes a JSON trace of a create/instantiate/destroy workload to `trace.json`

use chunk_store::prelude::*;
use std::{fs::File, time::Instant};

#[derive(Debug, Clone, Copy, bytemuck::Zeroable)]
struct Position(f32, f32, f32);

#[derive(Debug, Clone, Copy, bytemuck::Zeroable)]
struct Velocity(f32, f32, f32);

#[derive(Debug, Clone, Copy, bytemuck::Zeroable)]
struct Health(u32);

#[tracing::instrument(skip(manager))]
fn profile_creates(manager: &mut EntityManager, count: usize) -> Result<Vec<Entity>> {
    let archetype = manager.create_archetype(&[
        ComponentType::write::<Position>(),
        ComponentType::write::<Velocity>(),
        ComponentType::write::<Health>(),
    ])?;
    let mut entities = Vec::with_capacity(count);
    for i in 0..count {
        if i % 1_000 == 0 {
            tracing::info!("Creating entity {}/{}", i, count);
        }
        let entity = manager.create_entity(archetype)?;
        manager.set_component(entity, Health(100))?;
        entities.push(entity);
    }
    Ok(entities)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let file = File::create("trace.json")?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::TRACE)
        .init();

    let mut manager = EntityManager::new();

    println!("Profiling create with 3 components...");
    let start = Instant::now();
    let entities = profile_creates(&mut manager, 10_000)?;
    println!("Create 10k entities complete in: {:?}", start.elapsed());

    let start = Instant::now();
    {
        let _span = tracing::info_span!("instantiate", count = 10_000).entered();
        manager.instantiate(entities[0], 10_000)?;
    }
    println!("Instantiate 10k entities complete in: {:?}", start.elapsed());

    let start = Instant::now();
    {
        let _span = tracing::info_span!("destroy", count = entities.len()).entered();
        manager.destroy_entities(&entities)?;
    }
    println!("Destroy 10k entities complete in: {:?}", start.elapsed());

    manager.check_internal_consistency();
    StoreInspector::print_summary(&manager);
    Ok(())
}
