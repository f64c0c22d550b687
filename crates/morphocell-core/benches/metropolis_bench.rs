use criterion::{Criterion, criterion_group, criterion_main};
use morphocell_core::{
    EnergyTerm, Label, LatticeView, MetropolisAlgorithm, PottsConfig, PottsState,
};
use morphocell_lattice::{Dim3, Lattice, Point3};
use std::hint::black_box;

struct ContactPenalty {
    j: f64,
}

impl EnergyTerm for ContactPenalty {
    fn delta(
        &self,
        view: &LatticeView<'_>,
        pt: Point3,
        new_label: Label,
        old_label: Label,
    ) -> f64 {
        let mut before = 0i32;
        let mut after = 0i32;
        for neighbor in view.field.neighbors(pt, view.neighbors) {
            let label = view.field.at(neighbor).unwrap_or_default();
            if label != old_label {
                before += 1;
            }
            if label != new_label {
                after += 1;
            }
        }
        self.j * f64::from(after - before)
    }
}

/// 32x32x32 lattice with a 32x16x16 slab tiled by sixteen 8x8x8 cells.
fn bench_state(algorithm: MetropolisAlgorithm) -> PottsState {
    let config = PottsConfig {
        dim: Dim3::new(32, 32, 32),
        rng_seed: Some(17),
        metropolis_algorithm: algorithm,
        worker_count: 1,
        ..PottsConfig::default()
    };
    let mut state = PottsState::new(config).expect("state");
    for cz in 0..2 {
        for cy in 0..2 {
            for cx in 0..4 {
                let origin = Point3::new(cx * 8, cy * 8, cz * 8);
                let key = state
                    .create_cell_at(origin, 1, None)
                    .expect("create cell");
                for z in 0..8 {
                    for y in 0..8 {
                        for x in 0..8 {
                            state
                                .set_cell_label(
                                    Point3::new(origin.x + x, origin.y + y, origin.z + z),
                                    Some(key),
                                )
                                .expect("bind");
                        }
                    }
                }
            }
        }
    }
    state.register_energy_function("Contact", Box::new(ContactPenalty { j: 1.0 }));
    state.recompute_total_energy();
    state
}

fn metropolis_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("metropolis");
    for (name, algorithm) in [
        ("list", MetropolisAlgorithm::List),
        ("fast", MetropolisAlgorithm::Fast),
        ("boundary_walker", MetropolisAlgorithm::BoundaryWalker),
    ] {
        let mut state = bench_state(algorithm);
        group.bench_function(name, |b| {
            b.iter(|| black_box(state.metropolis(10_000, 8.0)));
        });
    }
    group.finish();
}

criterion_group!(benches, metropolis_strategies);
criterion_main!(benches);
