//! End-to-end meshing scenarios
use isomesh::{
    field::{cuboid, sphere, Tree},
    Algorithm, Error, Mesh, ProgressSink, Region, Settings,
};
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

fn settings() -> Settings<'static> {
    Settings {
        workers: 4,
        min_feature: 0.1,
        max_err: 1e-8,
        ..Settings::default()
    }
}

fn render(shape: &Tree, region: Region, settings: &Settings) -> Mesh {
    let _ = env_logger::builder().is_test(true).try_init();
    Mesh::render(&shape.evaluator(), region, settings).unwrap()
}

type Key = (OrderedFloat<f32>, OrderedFloat<f32>, OrderedFloat<f32>);

fn key(v: &Vector3<f32>) -> Key {
    (OrderedFloat(v.x), OrderedFloat(v.y), OrderedFloat(v.z))
}

/// Triangles as position triples, rotated and sorted into a canonical
/// order (winding is preserved) so that meshes can be compared across
/// runs that emit triangles in different orders
fn canonical(mesh: &Mesh) -> Vec<[Vector3<f32>; 3]> {
    let mut soup: Vec<[Vector3<f32>; 3]> = mesh
        .triangles
        .iter()
        .map(|t| {
            let mut tri =
                [0, 1, 2].map(|i| mesh.vertices[t[i] as usize]);
            let first =
                (0..3).min_by_key(|&i| key(&tri[i])).unwrap();
            tri.rotate_left(first);
            tri
        })
        .collect();
    soup.sort_by_key(|t| t.map(|v| key(&v)));
    soup
}

/// Checks that every triangle edge is shared by exactly two triangles
/// with opposite orientations
fn check_watertight(mesh: &Mesh) -> Result<(), String> {
    let mut edges: BTreeMap<(u32, u32), usize> = BTreeMap::new();
    for t in &mesh.triangles {
        if t.x == t.y || t.y == t.z || t.x == t.z {
            return Err(format!("triangle {t:?} has duplicate indices"));
        }
        for e in [(t.x, t.y), (t.y, t.z), (t.z, t.x)] {
            *edges.entry(e).or_default() += 1;
        }
    }
    for (&(a, b), &n) in &edges {
        if n != 1 {
            return Err(format!("edge ({a}, {b}) appears {n} times"));
        }
        if !edges.contains_key(&(b, a)) {
            return Err(format!("edge ({a}, {b}) is unpaired"));
        }
    }
    Ok(())
}

/// Signed volume of a closed mesh; positive for outward windings
fn signed_volume(mesh: &Mesh) -> f64 {
    mesh.triangles
        .iter()
        .map(|t| {
            let [a, b, c] =
                [0, 1, 2].map(|i| mesh.vertices[t[i] as usize].cast::<f64>());
            a.dot(&b.cross(&c)) / 6.0
        })
        .sum()
}

/// A level-`n` Menger sponge built on the cube `[lo, hi]³`
///
/// Square rods are subtracted through every cell of each generation's
/// grid; subtracting from already-removed material is a no-op, so the
/// rods don't need to track which cells survive.
fn menger(levels: u32, lo: f32, hi: f32) -> Tree {
    let mut shape = cuboid([lo; 3], [hi; 3]);
    let axes: [fn() -> (Tree, Tree); 3] = [
        || (Tree::x(), Tree::y()),
        || (Tree::y(), Tree::z()),
        || (Tree::z(), Tree::x()),
    ];
    for level in 1..=levels {
        let n = 3u32.pow(level - 1);
        let cell = (hi - lo) / n as f32;
        let half = cell / 6.0;
        for i in 0..n {
            for j in 0..n {
                let ci = lo + (i as f32 + 0.5) * cell;
                let cj = lo + (j as f32 + 0.5) * cell;
                for mk in axes {
                    let (u, v) = mk();
                    let rod =
                        (u - ci).abs().max((v - cj).abs()) - half;
                    shape = shape.max(-rod);
                }
            }
        }
    }
    shape
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn test_sphere() {
    let shape = sphere([0.0; 3], 0.5);
    let mesh = render(&shape, Region::symmetric(1.0), &settings());

    assert!(
        mesh.triangles.len() > 1000,
        "only {} triangles",
        mesh.triangles.len()
    );
    for v in &mesh.vertices[1..] {
        assert!(
            (v.norm() - 0.5).abs() < 0.05,
            "vertex {v:?} is not on the sphere"
        );
    }
    // Index 0 is the sentinel slot and never referenced
    for t in &mesh.triangles {
        assert!(t.iter().all(|&i| i >= 1 && (i as usize) < mesh.vertices.len()));
    }
    check_watertight(&mesh).unwrap();

    // Windings must be outward
    let vol = signed_volume(&mesh);
    let expected = 4.0 / 3.0 * std::f64::consts::PI * 0.125;
    assert!(
        (vol - expected).abs() < 0.1 * expected,
        "bad signed volume {vol}, expected {expected}"
    );

    // Euler characteristic of a closed genus-0 surface
    let mut edges = std::collections::BTreeSet::new();
    let mut verts = std::collections::BTreeSet::new();
    for t in &mesh.triangles {
        for e in [(t.x, t.y), (t.y, t.z), (t.z, t.x)] {
            edges.insert((e.0.min(e.1), e.0.max(e.1)));
        }
        verts.extend([t.x, t.y, t.z]);
    }
    let euler =
        verts.len() as i64 - edges.len() as i64 + mesh.triangles.len() as i64;
    assert_eq!(euler, 2);
}

#[test]
fn test_box_planes() {
    let shape =
        Tree::x().abs().max(Tree::y().abs()).max(Tree::z().abs()) - 0.3;
    let mesh = render(&shape, Region::symmetric(1.0), &settings());
    assert!(!mesh.triangles.is_empty());
    check_watertight(&mesh).unwrap();
    for v in &mesh.vertices[1..] {
        let d = (0..3)
            .map(|i| (v[i].abs() - 0.3).abs())
            .fold(f32::INFINITY, f32::min);
        assert!(d < 0.05, "vertex {v:?} is not on a box face");
    }
}

#[test]
fn test_union() {
    // A box poking out of a sphere
    let shape = sphere([0.0; 3], 0.5)
        .min(cuboid([-0.85, -0.3, -0.3], [0.2, 0.3, 0.3]));
    let mesh = render(&shape, Region::symmetric(1.0), &settings());
    assert!(!mesh.triangles.is_empty());
    check_watertight(&mesh).unwrap();
    // The union must reach beyond the sphere
    assert!(mesh.vertices[1..].iter().any(|v| v.x < -0.6));
}

#[test]
fn test_intersection() {
    // A box entirely inside the sphere intersects to itself
    let shape = sphere([0.0; 3], 0.5).max(cuboid([-0.2; 3], [0.2; 3]));
    let mesh = render(&shape, Region::symmetric(1.0), &settings());
    assert!(!mesh.triangles.is_empty());
    check_watertight(&mesh).unwrap();

    // Translating the box away from the sphere empties the intersection
    let shape = sphere([0.0; 3], 0.5).max(cuboid([2.0; 3], [2.4; 3]));
    let mesh = render(&shape, Region::symmetric(1.0), &settings());
    assert!(mesh.triangles.is_empty());
}

#[test]
fn test_empty_and_filled_fields() {
    // A field that's negative everywhere in the region meshes to nothing
    let mesh = render(
        &Tree::constant(-1.0),
        Region::symmetric(1.0),
        &settings(),
    );
    assert!(mesh.triangles.is_empty());

    // ...and so does one that's positive everywhere
    let mesh =
        render(&Tree::constant(1.0), Region::symmetric(1.0), &settings());
    assert!(mesh.triangles.is_empty());
}

#[test]
fn test_single_leaf_region() {
    // With min_feature at the region size, the root is a single cell; a
    // sign change on its edges has no adjacent cells to close a surface
    let shape = sphere([-1.0; 3], 0.5);
    let mesh = render(
        &shape,
        Region::symmetric(1.0),
        &Settings {
            min_feature: 4.0,
            ..settings()
        },
    );
    assert!(mesh.triangles.is_empty());
}

#[test]
fn test_thread_count_determinism() {
    let shape = sphere([0.0; 3], 0.5).min(cuboid([0.0; 3], [0.8; 3]));
    let reference = canonical(&render(
        &shape,
        Region::symmetric(1.0),
        &Settings {
            workers: 1,
            ..settings()
        },
    ));
    for workers in [2, 8] {
        let mesh = render(
            &shape,
            Region::symmetric(1.0),
            &Settings {
                workers,
                ..settings()
            },
        );
        assert_eq!(
            canonical(&mesh),
            reference,
            "geometry changed with {workers} workers"
        );
    }
}

#[test]
fn test_stl_round_trip() {
    let shape = sphere([0.0; 3], 0.5);
    let mesh = render(&shape, Region::symmetric(1.0), &settings());

    let mut buf = vec![];
    mesh.write_stl(&mut buf).unwrap();
    let soup = Mesh::read_stl(&mut buf.as_slice()).unwrap();

    let mut from_stl: Vec<[Vector3<f32>; 3]> = soup
        .into_iter()
        .map(|mut tri| {
            let first = (0..3).min_by_key(|&i| key(&tri[i])).unwrap();
            tri.rotate_left(first);
            tri
        })
        .collect();
    from_stl.sort_by_key(|t| t.map(|v| key(&v)));
    assert_eq!(from_stl, canonical(&mesh));
}

#[test]
fn test_translation_equivariance() {
    let t = Vector3::new(0.25, -0.5, 0.125);
    let a = render(&sphere([0.0; 3], 0.5), Region::symmetric(1.0), &settings());
    let b = render(
        &sphere([t.x, t.y, t.z], 0.5),
        Region::new(
            Vector3::new(-1.0, -1.0, -1.0) + t,
            Vector3::new(1.0, 1.0, 1.0) + t,
        ),
        &settings(),
    );
    let a = canonical(&a);
    let b = canonical(&b);
    assert_eq!(a.len(), b.len());
    for (ta, tb) in a.iter().zip(&b) {
        for (va, vb) in ta.iter().zip(tb) {
            assert!(
                (va + t - vb).norm() < 1e-3,
                "{va:?} + {t:?} != {vb:?}"
            );
        }
    }
}

#[test]
fn test_menger_sponge() {
    let shape = menger(2, 0.0, 0.9);
    let region = Region::new(
        Vector3::new(-0.5, -0.5, -0.5),
        Vector3::new(1.0, 1.0, 1.0),
    );
    let reference = render(
        &shape,
        region,
        &Settings {
            workers: 1,
            min_feature: 0.03,
            ..settings()
        },
    );
    assert!(!reference.triangles.is_empty());

    let mesh = render(
        &shape,
        region,
        &Settings {
            workers: 4,
            min_feature: 0.03,
            ..settings()
        },
    );
    // Geometry is deterministic, so the triangle count must stay within
    // a whisker of the reference run
    let a = reference.triangles.len() as f64;
    let b = mesh.triangles.len() as f64;
    assert!(
        (a - b).abs() <= 0.1 * a,
        "triangle counts diverged: {a} vs {b}"
    );
}

#[test]
fn test_cancellation() {
    let shape = menger(3, 0.0, 0.9);
    let cancel = AtomicBool::new(false);
    let settings = Settings {
        workers: 4,
        min_feature: 0.005,
        cancel: Some(&cancel),
        ..Settings::default()
    };

    std::thread::scope(|s| {
        let cancel = &cancel;
        let observed = s.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            cancel.store(true, Ordering::Relaxed);
            std::time::Instant::now()
        });
        let result = Mesh::render(
            &shape.evaluator(),
            Region::symmetric(1.0),
            &settings,
        );
        let returned = std::time::Instant::now();
        assert!(matches!(result, Err(Error::Cancelled)));
        let observed = observed.join().unwrap();
        // Workers poll the flag between tasks, so teardown is quick
        assert!(
            returned.duration_since(observed)
                < std::time::Duration::from_secs(2),
            "cancellation took too long"
        );
    });

    // A pre-set flag returns before any work starts
    cancel.store(true, Ordering::Relaxed);
    let result =
        Mesh::render(&shape.evaluator(), Region::symmetric(1.0), &settings);
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn test_invalid_settings() {
    let shape = sphere([0.0; 3], 0.5);
    let eval = shape.evaluator();
    let region = Region::symmetric(1.0);

    let r = Mesh::render(
        &eval,
        region,
        &Settings {
            workers: 0,
            ..settings()
        },
    );
    assert!(matches!(r, Err(Error::NoWorkers)));

    let r = Mesh::render(
        &eval,
        region,
        &Settings {
            min_feature: -1.0,
            ..settings()
        },
    );
    assert!(matches!(r, Err(Error::BadMinFeature(..))));

    let inverted = Region::new(
        Vector3::new(1.0, -1.0, -1.0),
        Vector3::new(-1.0, 1.0, 1.0),
    );
    let r = Mesh::render(&eval, inverted, &settings());
    assert!(matches!(r, Err(Error::EmptyRegion)));

    for alg in [Algorithm::Simplex, Algorithm::Hybrid] {
        let r = Mesh::render(
            &eval,
            region,
            &Settings {
                alg,
                ..settings()
            },
        );
        assert!(matches!(r, Err(Error::UnsupportedAlgorithm(..))));
    }
}

#[test]
fn test_progress_reporting() {
    #[derive(Default)]
    struct Sink {
        started: AtomicU64,
        phases: AtomicU64,
        ticks: AtomicU64,
        finished: AtomicU64,
    }
    impl ProgressSink for Sink {
        fn start(&self, weights: &[u32]) {
            assert_eq!(weights.len(), 2);
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn next_phase(&self, total: u64) {
            assert!(total > 0);
            self.phases.fetch_add(1, Ordering::Relaxed);
        }
        fn tick(&self, n: u64) {
            self.ticks.fetch_add(n, Ordering::Relaxed);
        }
        fn finish(&self) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    let sink = Sink::default();
    let shape = sphere([0.0; 3], 0.5);
    let mesh = Mesh::render(
        &shape.evaluator(),
        Region::symmetric(1.0),
        &Settings {
            progress: Some(&sink),
            ..settings()
        },
    )
    .unwrap();
    assert!(!mesh.triangles.is_empty());
    assert_eq!(sink.started.load(Ordering::Relaxed), 1);
    assert_eq!(sink.phases.load(Ordering::Relaxed), 2);
    assert_eq!(sink.finished.load(Ordering::Relaxed), 1);
    assert!(sink.ticks.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_free_thread_handler() {
    struct Handler(AtomicU64);
    impl isomesh::FreeThreadHandler for Handler {
        fn offer_wait(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
            std::thread::yield_now();
        }
    }

    let handler = Handler(AtomicU64::new(0));
    let shape = sphere([0.0; 3], 0.5);
    let mesh = Mesh::render(
        &shape.evaluator(),
        Region::symmetric(1.0),
        &Settings {
            workers: 8,
            free_thread: Some(&handler),
            ..settings()
        },
    )
    .unwrap();
    assert!(!mesh.triangles.is_empty());
    // With more workers than initial tasks, somebody must have idled
    assert!(handler.0.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_volume_prefilter() {
    // An analytic pre-classifier for a sphere: compares the region's
    // nearest and farthest corners against the radius
    struct SphereVol {
        center: Vector3<f32>,
        radius: f32,
    }
    impl isomesh::VolumePrefilter for SphereVol {
        fn check(&self, region: &Region) -> isomesh::CellClass {
            let mut near = 0.0f32;
            let mut far = 0.0f32;
            for i in 0..3 {
                let lo = region.lower[i] - self.center[i];
                let hi = region.upper[i] - self.center[i];
                let lo_abs = lo.abs();
                let hi_abs = hi.abs();
                far += lo_abs.max(hi_abs).powi(2);
                if lo > 0.0 || hi < 0.0 {
                    near += lo_abs.min(hi_abs).powi(2);
                }
            }
            if far.sqrt() < self.radius {
                isomesh::CellClass::Filled
            } else if near.sqrt() > self.radius {
                isomesh::CellClass::Empty
            } else {
                isomesh::CellClass::Ambiguous
            }
        }
        fn push(
            &self,
            _child: isomesh::types::Corner,
        ) -> Option<&dyn isomesh::VolumePrefilter> {
            // The check is analytic, so it serves every sub-region too
            Some(self)
        }
    }

    let shape = sphere([0.0; 3], 0.5);
    let vol = SphereVol {
        center: Vector3::zeros(),
        radius: 0.5,
    };
    let plain = render(&shape, Region::symmetric(1.0), &settings());
    let filtered = render(
        &shape,
        Region::symmetric(1.0),
        &Settings {
            vol: Some(&vol),
            ..settings()
        },
    );
    assert_eq!(canonical(&plain), canonical(&filtered));
}
