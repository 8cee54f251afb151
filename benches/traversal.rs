use criterion::{black_box, criterion_group, criterion_main, Criterion};

use selva::hierarchy::traversal::{traverse, Callbacks, Direction};
use selva::hierarchy::Hierarchy;
use selva::nodeid::NodeId;

/// A root with `width` direct children, each holding `width` grandchildren.
fn build_tree(width: usize) -> (Hierarchy, NodeId) {
    let mut h = Hierarchy::new();
    let root = NodeId::from_str_padded("root");
    h.upsert(root, false);

    for i in 0..width {
        let child = NodeId::from_str_padded(&format!("c{i:08}"));
        h.upsert(child, false);
        h.add_children(root, &[child]).unwrap();
        for j in 0..width {
            let grandchild = NodeId::from_str_padded(&format!("g{i:04}{j:04}"));
            h.upsert(grandchild, false);
            h.add_children(child, &[grandchild]).unwrap();
        }
    }
    (h, root)
}

fn bench_bfs_descendants(c: &mut Criterion) {
    let (mut h, root) = build_tree(20);
    c.bench_function("bfs_descendants_20x20", |b| {
        b.iter(|| {
            let mut visited = 0usize;
            let mut cb = Callbacks { node: Some(Box::new(|_h, _id| { visited += 1; Ok(()) })), ..Callbacks::default() };
            traverse(black_box(&mut h), root, Direction::BfsDescendants, &mut cb).unwrap();
            black_box(visited)
        })
    });
}

fn bench_dfs_descendants(c: &mut Criterion) {
    let (mut h, root) = build_tree(20);
    c.bench_function("dfs_descendants_20x20", |b| {
        b.iter(|| {
            let mut visited = 0usize;
            let mut cb = Callbacks { node: Some(Box::new(|_h, _id| { visited += 1; Ok(()) })), ..Callbacks::default() };
            traverse(black_box(&mut h), root, Direction::DfsDescendants, &mut cb).unwrap();
            black_box(visited)
        })
    });
}

criterion_group!(benches, bench_bfs_descendants, bench_dfs_descendants);
criterion_main!(benches);
