use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use silentot_core::{Block, test_utils::init_bench_tracing};
use silentot_net::testing::local_conn;
use silentot_pprf::{
    OutFormat, PARALLEL_TREES, PprfConfig, PprfOutput, RegularPprfReceiver, RegularPprfSender,
    fake_base,
};
use tokio::runtime::{self, Runtime};

fn create_mt_runtime(threads: usize) -> Runtime {
    runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    init_bench_tracing();
    let rt = create_mt_runtime(8);
    let (mut c1, mut c2) = rt.block_on(local_conn()).unwrap();
    let threads = std::thread::available_parallelism().map_or(1, |n| n.get());

    let mut g = c.benchmark_group("pprf");
    for (name, log_ots, format) in [
        ("interleaved pprf for 2**20 OTs", 20, OutFormat::Interleaved),
        ("interleaved pprf for 2**24 OTs", 24, OutFormat::Interleaved),
        ("by leaf pprf for 2**20 OTs", 20, OutFormat::ByLeafIndex),
    ] {
        g.sample_size(10).bench_function(name, |b| {
            b.to_async(&rt).iter_batched(
                || {
                    let conf = conf(2_u64.pow(log_ots));
                    let mut rng = StdRng::seed_from_u64(42);
                    let (sender_base_ots, receiver_base_ots, base_choices) =
                        fake_base(conf, &mut rng);

                    let mut sender = RegularPprfSender::new(conf);
                    sender.set_base(sender_base_ots).unwrap();
                    let mut receiver = RegularPprfReceiver::new(conf);
                    receiver
                        .set_choice_bits(OutFormat::ByLeafIndex, &base_choices)
                        .unwrap();
                    receiver.set_base(receiver_base_ots).unwrap();
                    let output = || match format {
                        OutFormat::Interleaved => PprfOutput::interleaved(&conf),
                        _ => PprfOutput::by_leaf_index(&conf),
                    };
                    let seed: Block = rng.random();
                    (
                        sender,
                        receiver,
                        seed,
                        output(),
                        output(),
                        c1.sub_connection(),
                        c2.sub_connection(),
                    )
                },
                |(mut sender, mut receiver, seed, out1, out2, mut c1, mut c2)| async move {
                    let t1 = tokio::spawn(async move {
                        sender
                            .expand(&mut c1, &[Block::ONES], seed, out1, true, threads)
                            .await
                    });
                    let t2 = tokio::spawn(async move {
                        receiver.expand(&mut c2, out2, true, threads).await
                    });
                    let (r1, r2) = tokio::try_join!(t1, t2).unwrap();
                    r1.unwrap();
                    r2.unwrap();
                },
                BatchSize::LargeInput,
            )
        });
    }
}

#[allow(non_snake_case)]
fn get_reg_noise_weight(min_dist_ratio: f64, N: u64, sec_param: usize) -> u64 {
    assert!(min_dist_ratio <= 0.5 && min_dist_ratio > 0.0);
    let d = (1.0 - 2.0 * min_dist_ratio).log2();
    let t = 128.max((-(sec_param as f64) / d).ceil() as u64);
    t.next_multiple_of(PARALLEL_TREES as u64)
}

/// Parameters of a Silent OT with the ExConv7x24 code.
fn conf(num_ots: u64) -> PprfConfig {
    let scaler = 2;
    let num_partitions = get_reg_noise_weight(0.15, num_ots * scaler, 128);
    let size_per = (num_ots * scaler)
        .div_ceil(num_partitions)
        .next_multiple_of(8);
    PprfConfig::new(size_per as usize, num_partitions as usize).unwrap()
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
