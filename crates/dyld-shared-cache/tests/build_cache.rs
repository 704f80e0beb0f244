//! End-to-end coverage of the full dependency-graph -> build_cache pipeline,
//! exercising scenarios the per-module unit tests don't: diamond dependency
//! dedup, a three-level chain, and build determinism.

use dyld_shared_cache::builder::{build_cache, BuildOptions};
use dyld_shared_cache::depgraph::DependencyGraph;
use dyld_shared_cache::header;
use dyld_shared_cache::source::MapSource;
use dyld_shared_cache::test_support::build_cache_ready_dylib;
use macho_view::arch::Arch;
use macho_view::macho_const::CPU_TYPE_X86_64;

fn x86_64() -> Arch {
    Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap()
}

fn image_count(data: &[u8]) -> u32 {
    u32::from_le_bytes(data[0x1c..0x20].try_into().unwrap())
}

fn mapping_count(data: &[u8]) -> u32 {
    u32::from_le_bytes(data[0x14..0x18].try_into().unwrap())
}

#[test]
fn diamond_dependency_is_placed_once() {
    // root -> A, root -> B, A -> C, B -> C. C must appear exactly once in
    // the shareable set and the resulting image table, not twice.
    let mut source = MapSource::new();
    source.insert("/usr/lib/libC.dylib", build_cache_ready_dylib("/usr/lib/libC.dylib", &[]));
    source.insert("/usr/lib/libA.dylib", build_cache_ready_dylib("/usr/lib/libA.dylib", &["/usr/lib/libC.dylib"]));
    source.insert("/usr/lib/libB.dylib", build_cache_ready_dylib("/usr/lib/libB.dylib", &["/usr/lib/libC.dylib"]));
    source.insert(
        "/usr/lib/libRoot.dylib",
        build_cache_ready_dylib("/usr/lib/libRoot.dylib", &["/usr/lib/libA.dylib", "/usr/lib/libB.dylib"]),
    );

    let mut graph = DependencyGraph::new();
    let root = graph.add_root(&source, "/usr/lib/libRoot.dylib").unwrap();
    graph.load_all_dependencies(&source, root, "/usr/lib/libRoot.dylib").unwrap();

    assert_eq!(graph.nodes.len(), 4);
    let shareable = graph.find_shareable();
    assert_eq!(shareable.len(), 3, "root excluded, A/B/C each counted once");

    let result = build_cache(&mut graph, &x86_64(), &BuildOptions::default()).unwrap();
    assert_eq!(image_count(&result.data), 3);
    // Fixed TEXT/writable/read-only class mappings plus one merged
    // __LINKEDIT mapping, regardless of how many dylibs are shareable.
    assert_eq!(mapping_count(&result.data), 4);
}

#[test]
fn three_level_chain_builds_and_places_in_order() {
    let mut source = MapSource::new();
    source.insert("/usr/lib/libLeaf.dylib", build_cache_ready_dylib("/usr/lib/libLeaf.dylib", &[]));
    source.insert("/usr/lib/libMid.dylib", build_cache_ready_dylib("/usr/lib/libMid.dylib", &["/usr/lib/libLeaf.dylib"]));
    source.insert("/usr/lib/libTop.dylib", build_cache_ready_dylib("/usr/lib/libTop.dylib", &["/usr/lib/libMid.dylib"]));

    let mut graph = DependencyGraph::new();
    let top = graph.add_root(&source, "/usr/lib/libTop.dylib").unwrap();
    graph.load_all_dependencies(&source, top, "/usr/lib/libTop.dylib").unwrap();

    let result = build_cache(&mut graph, &x86_64(), &BuildOptions::default()).unwrap();
    assert_eq!(image_count(&result.data), 2, "libTop is the root and is never shareable itself");
    assert_eq!(&result.data[0..7], b"dyld_v1");
    assert!(result.data.len() > header::HEADER_SIZE);
}

#[test]
fn build_is_deterministic_across_runs() {
    let build = || {
        let mut source = MapSource::new();
        source.insert("/usr/lib/libB.dylib", build_cache_ready_dylib("/usr/lib/libB.dylib", &[]));
        source.insert("/usr/lib/libA.dylib", build_cache_ready_dylib("/usr/lib/libA.dylib", &["/usr/lib/libB.dylib"]));
        let mut graph = DependencyGraph::new();
        let a = graph.add_root(&source, "/usr/lib/libA.dylib").unwrap();
        graph.load_all_dependencies(&source, a, "/usr/lib/libA.dylib").unwrap();
        build_cache(&mut graph, &x86_64(), &BuildOptions::default()).unwrap().data
    };

    assert_eq!(build(), build());
}

#[test]
fn non_sharable_root_dependency_is_dropped_without_warning() {
    // A root's dependency outside /usr/lib or /System/Library is silently
    // dropped rather than failing the whole build.
    let mut source = MapSource::new();
    source.insert(
        "/usr/lib/libRoot.dylib",
        build_cache_ready_dylib("/usr/lib/libRoot.dylib", &["/opt/local/lib/libPrivate.dylib"]),
    );

    let mut graph = DependencyGraph::new();
    let root = graph.add_root(&source, "/usr/lib/libRoot.dylib").unwrap();
    graph.load_all_dependencies(&source, root, "/usr/lib/libRoot.dylib").unwrap();

    assert_eq!(graph.nodes.len(), 1, "the non-sharable dependency was never resolved into a node");
    assert!(graph.warnings.is_empty());

    let result = build_cache(&mut graph, &x86_64(), &BuildOptions::default()).unwrap();
    assert_eq!(image_count(&result.data), 0);
}
