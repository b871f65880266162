//! Proptest strategies for serial meshes and equation objects.
use crate::dof::DofType;
use crate::equation::EquationObject;
use crate::mesh::{BasisCoefficient, Entity, EntityMesh};
use ::proptest::collection::vec;
use ::proptest::prelude::*;

pub fn dof_type() -> impl Strategy<Value = DofType> {
    prop_oneof![
        Just(DofType::Ux),
        Just(DofType::Uy),
        Just(DofType::Temp),
        Just(DofType::P),
        (0u16..4).prop_map(DofType::Other),
    ]
}

/// A non-empty list of distinct dof types.
pub fn dof_types(max_types: usize) -> impl Strategy<Value = Vec<DofType>> {
    vec(dof_type(), 1..=max_types.max(1)).prop_map(|mut types| {
        let mut seen = Vec::new();
        types.retain(|t| {
            let new = !seen.contains(t);
            seen.push(*t);
            new
        });
        types
    })
}

/// A chain of entities `0, 1, ..., n - 1` on a single rank, with one two-entity element per link.
#[derive(Debug, Clone)]
pub struct ChainProblem {
    pub mesh: EntityMesh,
    pub objects: Vec<EquationObject>,
}

fn chain_entities(n: usize) -> Vec<Entity> {
    (0..n as u64).map(|id| Entity::new(id, 0)).collect()
}

/// Chains of `2..=max_entities` entities whose elements request random dof types.
pub fn chain_problem(max_entities: usize) -> impl Strategy<Value = ChainProblem> {
    (2..=max_entities.max(2))
        .prop_flat_map(|n| vec(dof_types(3), n - 1))
        .prop_filter_map("mesh construction failed", |element_types| {
            let n = element_types.len() + 1;
            let objects = element_types
                .into_iter()
                .enumerate()
                .map(|(i, types)| EquationObject::element(vec![i as u64, i as u64 + 1], types))
                .collect();
            let mesh = EntityMesh::new(chain_entities(n), Vec::new()).ok()?;
            Some(ChainProblem { mesh, objects })
        })
}

/// Chains whose entities are expanded in an existing basis: entity `i` combines basis functions
/// `i` and `i + 1` with random, well-conditioned weights.
pub fn chain_basis_problem(max_entities: usize) -> impl Strategy<Value = ChainProblem> {
    (2..=max_entities.max(2))
        .prop_flat_map(|n| vec(0.5..2.0f64, n))
        .prop_filter_map("mesh construction failed", |weights| {
            let n = weights.len();
            let entities = chain_entities(n)
                .into_iter()
                .zip(&weights)
                .map(|(entity, &w)| {
                    let id = entity.id;
                    entity.with_basis(vec![BasisCoefficient::new(id, 0, 1.0), BasisCoefficient::new(id + 1, 0, w)])
                })
                .collect();
            let objects = (0..n as u64 - 1)
                .map(|i| EquationObject::element(vec![i, i + 1], vec![DofType::Temp]))
                .collect();
            let mesh = EntityMesh::new(entities, Vec::new()).ok()?;
            Some(ChainProblem { mesh, objects })
        })
}
