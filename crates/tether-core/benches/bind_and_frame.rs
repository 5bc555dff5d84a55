use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tether_core::{MethodSpec, Runtime, RuntimeConfig, Variant};
use tether_sys::RawObject;
use tether_testhost::TestHost;

const GET_COUNT: MethodSpec = MethodSpec::new("Node", "get_count", 0x10);
const ECHO_STRING: MethodSpec = MethodSpec::new("Node", "echo_string", 0x11);
const ECHO_VARIANT: MethodSpec = MethodSpec::new("Node", "echo_variant", 0x12);

fn setup() -> (TestHost, Arc<Runtime>, RawObject) {
    let host = TestHost::new();
    host.define_method("Node", "get_count", 0x10, |call| call.ret(3i64));
    host.define_method("Node", "echo_string", 0x11, |call| {
        let text = call.arg_string(0);
        call.ret_string(&text);
    });
    host.define_method("Node", "echo_variant", 0x12, |call| {
        let value = call.arg_variant(0);
        call.ret_variant_copy(&value);
    });
    let rt = Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap();
    let node = host.construct("Node");
    (host, rt, node)
}

fn bench_resolve(c: &mut Criterion) {
    let (_host, rt, _) = setup();
    rt.binds().resolve_spec(&GET_COUNT);

    c.bench_function("resolve_cached", |b| {
        b.iter(|| rt.binds().resolve_spec(black_box(&GET_COUNT)));
    });
}

fn bench_calls(c: &mut Criterion) {
    let (_host, rt, node) = setup();
    let mut group = c.benchmark_group("ptrcall");

    group.bench_function("scalar_return", |b| {
        b.iter(|| unsafe { rt.call::<i64, _>(&GET_COUNT, &node, &[]) }.unwrap());
    });

    for len in [0usize, 16, 1024] {
        let text = "x".repeat(len);
        group.bench_with_input(BenchmarkId::new("string_echo", len), &text, |b, text| {
            b.iter(|| unsafe { rt.call::<String, _>(&ECHO_STRING, &node, &[black_box(text)]) }.unwrap());
        });
    }

    let nested = Variant::Array(
        (0..32)
            .map(|i| Variant::Array(vec![Variant::Int(i), Variant::from("item")]))
            .collect(),
    );
    group.bench_function("variant_echo_nested", |b| {
        b.iter(|| unsafe { rt.call::<Variant, _>(&ECHO_VARIANT, &node, &[black_box(&nested)]) }.unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_calls);
criterion_main!(benches);
