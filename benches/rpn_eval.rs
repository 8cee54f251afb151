use criterion::{black_box, criterion_group, criterion_main, Criterion};

use selva::object::Object;
use selva::rpn::{compile, eval_bool, Ctx};

fn bench_compile(c: &mut Criterion) {
    c.bench_function("rpn_compile_filter", |b| {
        b.iter(|| black_box(compile(black_box("\"score\" g #5 J \"name\" f \"alice\" F M")).unwrap()))
    });
}

fn bench_eval_bool(c: &mut Criterion) {
    let program = compile("\"score\" g #5 J \"name\" f \"alice\" F M").unwrap();
    let mut object = Object::default();
    object.set_ll("score", 10).unwrap();
    object.set_str("name", "alice").unwrap();
    let ctx = Ctx { object: Some(object), ..Ctx::new() };

    c.bench_function("rpn_eval_bool_filter", |b| {
        b.iter(|| black_box(eval_bool(black_box(&program), black_box(&ctx)).unwrap()))
    });
}

criterion_group!(benches, bench_compile, bench_eval_bool);
criterion_main!(benches);
