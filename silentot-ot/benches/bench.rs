use std::{
    env,
    time::{Duration, Instant},
};

use criterion::{
    BatchSize, BenchmarkGroup, Criterion, criterion_group, criterion_main, measurement::WallTime,
};
use rand::{SeedableRng, rngs::StdRng};
use silentot_core::{Block, test_utils::init_bench_tracing};
use silentot_net::{Connection, testing::local_conn};
use silentot_ot::{
    MaliciousMarker, RotReceiver, RotSender, Security, SemiHonestMarker,
    base::SimplestOt,
    random_choices,
    silent_ot::{
        MultType, SCALER, SemiHonestSilentOtReceiver, SemiHonestSilentOtSender, SilentOtReceiver,
        SilentOtSender,
    },
};
use tokio::runtime::{self, Runtime};

fn create_mt_runtime(threads: usize) -> Runtime {
    runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .unwrap()
}

fn get_var_size(var: &str, default: u32) -> u32 {
    env::var(var)
        .map(|s| s.parse().expect("not a number"))
        .unwrap_or(default)
}

/// Random silent OTs with base OTs generated outside of the measurement.
fn bench_random<S: Security>(
    g: &mut BenchmarkGroup<'_, WallTime>,
    rt: &Runtime,
    c1: &mut Connection,
    c2: &mut Connection,
    count: usize,
    mult_type: MultType,
) {
    let security = if S::MALICIOUS_SECURITY {
        "malicious"
    } else {
        "semi-honest"
    };
    let name = format!("{count} {security} random OTs {mult_type:?}");
    g.bench_function(name, |b| {
        b.to_async(rt).iter_custom(|iters| {
            let c11 = c1.sub_connection();
            let c22 = c2.sub_connection();

            async move {
                let mut duration = Duration::ZERO;
                let mut sender =
                    SilentOtSender::<S>::new(c11).with_mult_type(mult_type);
                let mut receiver =
                    SilentOtReceiver::<S>::new(c22).with_mult_type(mult_type);
                for _ in 0..iters {
                    sender.configure(count, SCALER).unwrap();
                    receiver.configure(count, SCALER).unwrap();
                    tokio::try_join!(sender.gen_silent_base_ots(), receiver.gen_silent_base_ots())
                        .unwrap();
                    let now = Instant::now();
                    tokio::try_join!(sender.random_send(count), receiver.random_receive(count))
                        .unwrap();
                    duration += now.elapsed();
                }
                duration
            }
        })
    });
}

fn criterion_benchmark(c: &mut Criterion) {
    init_bench_tracing();
    let rt = create_mt_runtime(8);
    let (mut c1, mut c2) = rt.block_on(local_conn()).unwrap();

    let count = 128;

    c.bench_function("128 base OT", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let mut rng1 = StdRng::seed_from_u64(42);
                let rng2 = StdRng::seed_from_u64(42 * 42);
                let choices = random_choices(count, &mut rng1);
                let sender = SimplestOt::new_with_rng(c1.sub_connection(), rng1);
                let receiver = SimplestOt::new_with_rng(c2.sub_connection(), rng2);
                (sender, receiver, choices)
            },
            |(mut sender, mut receiver, choices)| async move {
                let t1 = tokio::spawn(async move { sender.send(count).await });
                let t2 = tokio::spawn(async move { receiver.receive(&choices).await });
                let (a, b) = tokio::try_join!(t1, t2).unwrap();
                a.unwrap();
                b.unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    let mut g = c.benchmark_group("silent extension");
    let p = get_var_size("SILENTOT_BENCH_SILENT_OT_POWER", 21);
    let count = 2_usize.pow(p);
    g.sample_size(10);
    g.throughput(criterion::Throughput::Elements(count as u64));
    g.bench_function(format!("2**{p} correlated extension OTs"), |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let c11 = c1.sub_connection();
            let c22 = c2.sub_connection();

            async move {
                let mut duration = Duration::ZERO;
                // setup not included in duration
                let mut sender = SemiHonestSilentOtSender::new(c11);
                let mut receiver = SemiHonestSilentOtReceiver::new(c22);
                for _ in 0..iters {
                    let now = Instant::now();
                    (sender, receiver) = tokio::try_join!(
                        tokio::spawn(async move {
                            sender.correlated_send(count, Block::ONES).await.unwrap();
                            sender
                        }),
                        tokio::spawn(async move {
                            receiver.correlated_receive(count).await.unwrap();
                            receiver
                        })
                    )
                    .unwrap();
                    duration += now.elapsed();
                }
                duration
            }
        })
    });

    bench_random::<SemiHonestMarker>(&mut g, &rt, &mut c1, &mut c2, count, MultType::ExConv7x24);
    bench_random::<SemiHonestMarker>(&mut g, &rt, &mut c1, &mut c2, count, MultType::ExAcc11);
    bench_random::<MaliciousMarker>(&mut g, &rt, &mut c1, &mut c2, count, MultType::ExConv7x24);

    g.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
