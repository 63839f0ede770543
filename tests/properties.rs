use std::collections::{HashMap, HashSet};

use chunk_store::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct A(u32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct B(u64);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable)]
struct C(u16);

#[derive(Debug, Clone)]
enum Op {
    Create { with_b: bool },
    Destroy(usize),
    AddC(usize),
    RemoveC(usize),
    RemoveB(usize),
    Set(usize, u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<bool>().prop_map(|with_b| Op::Create { with_b }),
        2 => any::<usize>().prop_map(Op::Destroy),
        1 => any::<usize>().prop_map(Op::AddC),
        1 => any::<usize>().prop_map(Op::RemoveC),
        1 => any::<usize>().prop_map(Op::RemoveB),
        2 => (any::<usize>(), any::<u32>()).prop_map(|(i, v)| Op::Set(i, v)),
    ]
}

#[derive(Debug, Clone)]
struct Model {
    a: u32,
    has_b: bool,
    has_c: bool,
}

proptest! {
    #[test]
    fn multi_map_keeps_every_value(pairs in prop::collection::vec((0u8..16, any::<u32>()), 0..200)) {
        let mut map = ConcurrentMultiHashMap::new();
        let mut model: HashMap<u8, Vec<u32>> = HashMap::new();
        for (k, v) in &pairs {
            map.add(*k, *v);
            model.entry(*k).or_default().push(*v);
        }
        prop_assert_eq!(map.len(), pairs.len());
        for (k, expected) in &model {
            let mut values = map.values(*k);
            let mut expected = expected.clone();
            values.sort_unstable();
            expected.sort_unstable();
            prop_assert_eq!(values, expected);
        }
    }

    #[test]
    fn hash_map_matches_std(ops in prop::collection::vec((any::<bool>(), 0u16..64, any::<u32>()), 0..300)) {
        let mut map = ConcurrentHashMap::new();
        let mut model: HashMap<u16, u32> = HashMap::new();
        for (insert, k, v) in ops {
            if insert {
                let added = map.try_add(k, v);
                prop_assert_eq!(added, !model.contains_key(&k));
                model.entry(k).or_insert(v);
            } else {
                prop_assert_eq!(map.remove(k), model.remove(&k).is_some());
            }
            prop_assert_eq!(map.len(), model.len());
        }
        for (k, v) in &model {
            prop_assert_eq!(map.try_get_value(*k), Some(*v));
        }
    }

    #[test]
    fn store_stays_consistent(ops in prop::collection::vec(op(), 1..120)) {
        let mut em = EntityManager::with_config(StoreConfig::default().with_chunk_bytes(256)).unwrap();
        let base = em.create_archetype(&[ComponentType::write::<A>()]).unwrap();
        let with_b = em
            .create_archetype(&[ComponentType::write::<A>(), ComponentType::write::<B>()])
            .unwrap();
        let group = em
            .create_component_group(&[ComponentType::read::<A>(), ComponentType::subtractive::<C>()])
            .unwrap();

        let mut live: Vec<Entity> = Vec::new();
        let mut model: HashMap<Entity, Model> = HashMap::new();
        let pick = |live: &Vec<Entity>, i: usize| live[i % live.len()];

        for op in ops {
            match op {
                Op::Create { with_b: b } => {
                    let e = em.create_entity(if b { with_b } else { base }).unwrap();
                    live.push(e);
                    model.insert(e, Model { a: 0, has_b: b, has_c: false });
                }
                Op::Destroy(i) if !live.is_empty() => {
                    let e = live.swap_remove(i % live.len());
                    em.destroy_entity(e).unwrap();
                    model.remove(&e);
                    prop_assert!(em.destroy_entity(e).is_err());
                }
                Op::AddC(i) if !live.is_empty() => {
                    let e = pick(&live, i);
                    let m = model.get_mut(&e).unwrap();
                    let result = em.add_component(e, C(7));
                    prop_assert_eq!(result.is_ok(), !m.has_c);
                    m.has_c = true;
                }
                Op::RemoveC(i) if !live.is_empty() => {
                    let e = pick(&live, i);
                    let m = model.get_mut(&e).unwrap();
                    let result = em.remove_component::<C>(e);
                    prop_assert_eq!(result.is_ok(), m.has_c);
                    m.has_c = false;
                }
                Op::RemoveB(i) if !live.is_empty() => {
                    let e = pick(&live, i);
                    let m = model.get_mut(&e).unwrap();
                    let result = em.remove_component::<B>(e);
                    prop_assert_eq!(result.is_ok(), m.has_b);
                    m.has_b = false;
                }
                Op::Set(i, v) if !live.is_empty() => {
                    let e = pick(&live, i);
                    em.set_component(e, A(v)).unwrap();
                    model.get_mut(&e).unwrap().a = v;
                }
                _ => {}
            }
            em.check_internal_consistency();
        }

        prop_assert_eq!(em.entity_count(), model.len());
        for (e, m) in &model {
            prop_assert_eq!(em.get_component::<A>(*e).unwrap(), A(m.a));
            prop_assert_eq!(em.has_component::<B>(*e), m.has_b);
            prop_assert_eq!(em.has_component::<C>(*e), m.has_c);
        }

        let found = group.entity_array(&em).to_vec().unwrap();
        let unique: HashSet<Entity> = found.iter().copied().collect();
        prop_assert_eq!(unique.len(), found.len());
        let expected: HashSet<Entity> = model
            .iter()
            .filter(|(_, m)| !m.has_c)
            .map(|(e, _)| *e)
            .collect();
        prop_assert_eq!(unique, expected);
    }
}
