#![feature(test)]
#![deny(warnings)]

extern crate test;

use tokio::runtime::Runtime;

use traffic_arbiter::backend::Manageable;
use traffic_arbiter::pool::TrafficPolice;

#[derive(Clone)]
struct BenchItem;

impl Manageable for BenchItem {
    fn is_idle(&self) -> bool {
        true
    }
    fn is_saturated(&self) -> bool {
        false
    }
    fn is_multiplexed(&self) -> bool {
        false
    }
    fn close(&mut self) {}
}

fn rt() -> Runtime {
    Runtime::new().expect("rt build")
}

#[bench]
fn put_get_release_cycle(b: &mut test::Bencher) {
    let _ = pretty_env_logger::try_init();
    let rt = rt();
    let pool: TrafficPolice<BenchItem> = TrafficPolice::new(Some(8), false);
    rt.block_on(async {
        for _ in 0..8 {
            pool.put(BenchItem, &[], false).await.unwrap();
        }
    });

    b.iter(|| {
        rt.block_on(async {
            let borrowed = pool.get(false, false, false, None).await.unwrap();
            drop(borrowed);
        });
    });
}

#[bench]
fn put_under_lifo_eviction_pressure(b: &mut test::Bencher) {
    let _ = pretty_env_logger::try_init();
    let rt = rt();
    let pool: TrafficPolice<BenchItem> = TrafficPolice::new(Some(4), false);

    b.iter(|| {
        rt.block_on(async {
            pool.put(BenchItem, &[], false).await.unwrap();
        });
    });
}
