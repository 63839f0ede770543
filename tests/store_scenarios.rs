use chunk_store::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct A(i32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct B(i32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct C(f32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct Big([u8; 1024]);

fn ab_types() -> [ComponentType; 2] {
    [ComponentType::write::<A>(), ComponentType::write::<B>()]
}

#[test]
fn test_create_mutate_destroy() -> Result<()> {
    let mut em = EntityManager::new();
    let arch = em.create_archetype(&ab_types())?;
    let e1 = em.create_entity(arch)?;
    let e2 = em.create_entity(arch)?;
    let _e3 = em.create_entity(arch)?;

    em.set_component(e2, A(42))?;
    em.add_component(e2, C(1.5))?;

    let ab = em.create_component_group(&ab_types())?;
    let abc = em.create_component_group(&[
        ComponentType::write::<A>(),
        ComponentType::write::<B>(),
        ComponentType::write::<C>(),
    ])?;
    // A group over {A, B} also matches {A, B, C}; exclude C to count the rest
    let ab_only = em.create_component_group(&[
        ComponentType::write::<A>(),
        ComponentType::write::<B>(),
        ComponentType::subtractive::<C>(),
    ])?;

    assert_eq!(ab_only.calculate_length(&em), 2);
    assert_eq!(ab.calculate_length(&em), 3);
    assert_eq!(abc.calculate_length(&em), 1);
    assert_eq!(abc.entity_array(&em).to_vec()?, vec![e2]);
    assert_eq!(abc.component_data_array::<A>(&em)?.get(0)?, A(42));

    em.destroy_entity(e1)?;
    assert_eq!(ab_only.calculate_length(&em), 1);
    em.check_internal_consistency();
    Ok(())
}

#[test]
fn test_batched_instantiate() -> Result<()> {
    let mut em = EntityManager::new();
    let arch = em.create_archetype(&ab_types())?;
    let source = em.create_entity(arch)?;
    em.set_component(source, A(7))?;
    em.set_component(source, B(9))?;

    let copies = em.instantiate(source, 1000)?;
    assert_eq!(copies.len(), 1000);

    let mut unique = copies.clone();
    unique.push(source);
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 1001);

    for e in &copies {
        assert!(em.exists(*e));
        assert_eq!(em.get_component::<A>(*e)?, A(7));
        assert_eq!(em.get_component::<B>(*e)?, B(9));
    }
    assert_eq!(em.get_component::<A>(source)?, A(7));
    assert_eq!(em.get_component::<B>(source)?, B(9));
    em.check_internal_consistency();
    Ok(())
}

#[test]
fn test_swap_back_on_destroy() -> Result<()> {
    let mut em = EntityManager::new();
    let arch = em.create_archetype(&[ComponentType::write::<A>()])?;
    let entities = em.create_entities(arch, 5)?;
    for (i, e) in entities.iter().enumerate() {
        em.set_component(*e, A(i as i32))?;
    }

    let group = em.create_component_group(&[ComponentType::read::<A>()])?;
    assert_eq!(group.entity_array(&em).to_vec()?, entities);

    em.destroy_entity(entities[1])?;
    let after = group.entity_array(&em).to_vec()?;
    assert_eq!(
        after,
        vec![entities[0], entities[4], entities[2], entities[3]]
    );
    assert_eq!(em.get_component::<A>(entities[4])?, A(4));
    em.check_internal_consistency();
    Ok(())
}

#[test]
fn test_round_trip_survives_unrelated_migration() -> Result<()> {
    let mut em = EntityManager::new();
    let arch = em.create_archetype(&ab_types())?;
    let entities = em.create_entities(arch, 3)?;
    em.set_component(entities[0], A(-5))?;
    assert_eq!(em.get_component::<A>(entities[0])?, A(-5));

    em.add_component(entities[1], C(2.0))?;
    assert_eq!(em.get_component::<A>(entities[0])?, A(-5));
    em.remove_component::<B>(entities[2])?;
    assert_eq!(em.get_component::<A>(entities[0])?, A(-5));
    assert!(matches!(
        em.get_component::<B>(entities[2]),
        Err(EcsError::ComponentNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_archetype_identity() -> Result<()> {
    let mut em = EntityManager::new();
    let first = em.create_archetype(&ab_types())?;
    let second = em.create_archetype(&[ComponentType::read::<B>(), ComponentType::read::<A>()])?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_many_entities_span_chunks() -> Result<()> {
    let mut em = EntityManager::with_config(StoreConfig::default().with_chunk_bytes(1024))?;
    let arch = em.create_archetype(&ab_types())?;
    let entities = em.create_entities(arch, 5000)?;
    assert!(em.archetype_manager().archetype(arch).chunk_count() > 1);

    em.destroy_entities(&entities[1000..4000])?;
    assert_eq!(em.entity_count(), 2000);
    em.check_internal_consistency();

    let pooled = em.archetype_manager().pooled_chunk_count();
    assert!(pooled > 0);
    // Enough to exhaust the partially filled chunks and draw from the pool
    em.create_entities(arch, 500)?;
    assert!(em.archetype_manager().pooled_chunk_count() < pooled);
    em.check_internal_consistency();
    Ok(())
}

#[test]
fn test_config_from_json() -> Result<()> {
    let config = StoreConfig::from_json(r#"{ "chunk_bytes": 4096 }"#)?;
    assert_eq!(config.chunk_bytes, 4096);
    assert_eq!(config.initial_entity_capacity, 1024);
    assert!(StoreConfig::from_json(r#"{ "chunk_bytes": 100 }"#).is_err());
    let em = EntityManager::with_config(config)?;
    assert_eq!(em.config().chunk_bytes, 4096);
    Ok(())
}

#[test]
fn test_failed_move_leaves_both_stores_unchanged() -> Result<()> {
    let mut source = EntityManager::new();
    let small = source.create_archetype(&ab_types())?;
    let smalls = source.create_entities(small, 3)?;
    source.set_component(smalls[1], A(11))?;
    let big = source.create_archetype(&[ComponentType::write::<Big>()])?;
    let bigs = source.create_entities(big, 2)?;

    // Big rows cannot fit in a 512-byte chunk
    let mut target = EntityManager::with_config(StoreConfig::default().with_chunk_bytes(512))?;
    let archetypes_before = target.archetype_manager().len();
    assert!(matches!(
        target.move_entities_from(&mut source),
        Err(EcsError::InvalidComponentType(_))
    ));

    assert_eq!(source.entity_count(), 5);
    assert_eq!(target.entity_count(), 0);
    assert_eq!(target.archetype_manager().len(), archetypes_before);
    assert!(smalls.iter().chain(&bigs).all(|e| source.exists(*e)));
    assert_eq!(source.get_component::<A>(smalls[1])?, A(11));
    source.check_internal_consistency();
    target.check_internal_consistency();

    source.destroy_entities(&bigs)?;
    let remap = target.move_entities_from(&mut source)?;
    assert_eq!(remap.len(), 3);
    assert_eq!(source.entity_count(), 0);
    let (_, moved) = remap
        .iter()
        .copied()
        .find(|(old, _)| *old == smalls[1])
        .ok_or(EcsError::EntityNotFound(smalls[1]))?;
    assert_eq!(target.get_component::<A>(moved)?, A(11));
    target.check_internal_consistency();
    Ok(())
}
