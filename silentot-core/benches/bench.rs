use criterion::{Criterion, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use silentot_core::{Block, aes_hash::FIXED_KEY_HASH, aes_rng::AesRng};

fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = AesRng::from_seed(Block::ONES);
    let a: Block = rng.random();
    let b: Block = rng.random();
    c.bench_function("gf_mul", |bencher| {
        bencher.iter(|| std::hint::black_box(a).gf_mul(&b))
    });

    let mut buf = vec![Block::ZERO; 1 << 16];
    rng.fill(bytemuck::cast_slice_mut::<_, u8>(&mut buf));
    c.bench_function("cr_hash_slice_mut 2**16 blocks", |bencher| {
        bencher.iter(|| FIXED_KEY_HASH.cr_hash_slice_mut(&mut buf))
    });

    let mut bytes = vec![0_u8; 1 << 20];
    c.bench_function("AesRng fill 1 MiB", |bencher| {
        bencher.iter(|| rng.fill(&mut bytes[..]))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
