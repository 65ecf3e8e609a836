use criterion::{black_box, criterion_group, criterion_main, Criterion};
use malloc_accounting_proxy::allocator::{FreeFn, Interposer, MallocFn};
use malloc_accounting_proxy::resolve::NextSymbol;
use malloc_accounting_proxy::{AccountingConfig, Registry};

static REAL_MALLOC: NextSymbol<MallocFn> = NextSymbol::new("malloc\0");
static REAL_FREE: NextSymbol<FreeFn> = NextSymbol::new("free\0");
static REGISTRY: Registry = Registry::new();

fn small_alloc_benchmark(c: &mut Criterion) {
    let interposer = Interposer::new(&REGISTRY, libc::malloc_usable_size);
    let _ = AccountingConfig::default().enable_event_log(false);
    c.bench_function("small_alloc_benchmark", |b| {
        b.iter(|| unsafe {
            let ptr = interposer.malloc(REAL_MALLOC.get(), black_box(128));
            interposer.free(REAL_FREE.get(), ptr);
        })
    });
}

fn logged_alloc_benchmark(c: &mut Criterion) {
    let interposer = Interposer::new(&REGISTRY, libc::malloc_usable_size);
    let _ = AccountingConfig::default().enable_event_log(true);
    c.bench_function("logged_alloc_benchmark", |b| {
        b.iter(|| unsafe {
            let ptr = interposer.malloc(REAL_MALLOC.get(), black_box(128));
            interposer.free(REAL_FREE.get(), ptr);
        })
    });
}

criterion_group!(benches, small_alloc_benchmark, logged_alloc_benchmark);
criterion_main!(benches);
