use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use remote_object::core::object::{Class, Instance};
use remote_object::core::value::{ObjectRef, Value};
use remote_object::protocol::boxing::Boxer;
use remote_object::protocol::message::{Message, Request, Target};
use remote_object::protocol::registry::{LocalObjectTable, ProxyRegistry};
use remote_object::utils::metrics::Metrics;

struct Lib;

fn nested_tuple(depth: usize) -> Value {
    let leaf = Value::Tuple(vec![
        Value::Int(42),
        Value::Str("argument".into()),
        Value::Float(1.5),
        Value::Bool(true),
    ]);
    (0..depth).fold(leaf, |inner, _| Value::Tuple(vec![inner.clone(), inner]))
}

#[allow(clippy::unwrap_used)]
fn bench_box_unbox(c: &mut Criterion) {
    let mut group = c.benchmark_group("boxing");
    let local = LocalObjectTable::new();
    let proxies = ProxyRegistry::detached(1);
    let metrics = Metrics::new();
    let boxer = Boxer::new(&local, &proxies, &metrics);

    for depth in [0usize, 4, 8] {
        let value = nested_tuple(depth);
        group.bench_function(format!("box_tuple_depth_{depth}"), |b| {
            b.iter(|| boxer.box_value(&value).unwrap())
        });
        let boxed = boxer.box_value(&value).unwrap();
        group.bench_function(format!("unbox_tuple_depth_{depth}"), |b| {
            b.iter_batched(
                || boxed.clone(),
                |boxed| boxer.unbox(boxed).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    // the same object boxed repeatedly hits the existing table entry
    let obj: ObjectRef = Instance::new(Class::<Lib>::builder("bench.Lib").build(), Lib);
    let value = Value::Object(obj);
    group.bench_function("box_object_reference", |b| {
        b.iter(|| boxer.box_value(&value).unwrap())
    });

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_request_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_bincode");
    let local = LocalObjectTable::new();
    let proxies = ProxyRegistry::detached(1);
    let metrics = Metrics::new();
    let boxer = Boxer::new(&local, &proxies, &metrics);

    let message = Message::Request {
        seq: 1,
        request: Request::Invoke {
            target: Target::Root,
            name: "run_keyword".into(),
            args: vec![boxer.box_value(&nested_tuple(3)).unwrap()],
            kwargs: vec![],
        },
    };
    group.bench_function("encode", |b| b.iter(|| message.encode().unwrap()));

    let blob = message.encode().unwrap();
    group.bench_function("decode", |b| b.iter(|| Message::decode(&blob).unwrap()));

    group.finish();
}

criterion_group!(benches, bench_box_unbox, bench_request_encoding);
criterion_main!(benches);
