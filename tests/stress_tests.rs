//! Stress tests for the daemon's concurrent data structures
//!
//! These exercise the allocators, the id index and the job bus under
//! thread churn; no root or kernel surface is required.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use sandboxd::engine::{Engine, Status};
use sandboxd::network::{IpAllocator, PortAllocator, PortMapper, Proto};
use sandboxd::truncindex::TruncIndex;

static STRESS_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Many threads hammering explicit and automatic port requests.
#[test]
fn stress_port_allocator_concurrency() {
    let _lock = STRESS_TEST_LOCK.lock();
    let alloc = Arc::new(PortAllocator::new());
    let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let alloc = Arc::clone(&alloc);
        handles.push(std::thread::spawn(move || {
            let mut mine = Vec::new();
            for _ in 0..100 {
                mine.push(alloc.request_port(ip, Proto::Tcp, 0).unwrap());
            }
            mine
        }));
    }
    let mut all: Vec<u16> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    // No double allocation anywhere.
    assert_eq!(all.len(), total);
    assert_eq!(alloc.allocated(ip, Proto::Tcp), total);

    for port in all {
        alloc.release_port(ip, Proto::Tcp, port);
    }
    assert_eq!(alloc.allocated(ip, Proto::Tcp), 0);
}

/// Allocate a full /24 pool, release, allocate again.
#[test]
fn stress_ip_allocator_cycles() {
    let _lock = STRESS_TEST_LOCK.lock();
    let net = "192.168.42.1/24".parse().unwrap();
    let alloc = IpAllocator::new();

    for _ in 0..3 {
        let mut ips = Vec::new();
        // 256 addresses minus network, gateway and broadcast.
        for _ in 0..253 {
            ips.push(alloc.request_ip(net, None).unwrap());
        }
        assert!(alloc.request_ip(net, None).is_err());
        for ip in ips {
            alloc.release_ip(net, ip);
        }
        assert_eq!(alloc.allocated(net), 0);
    }
}

/// Map/unmap churn without an installed chain.
#[test]
fn stress_port_mapper_churn() {
    let _lock = STRESS_TEST_LOCK.lock();
    let mapper = PortMapper::new(Arc::new(PortAllocator::new()));
    let container = SocketAddrV4::new(Ipv4Addr::new(172, 17, 0, 2), 80);
    let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    for round in 0..20 {
        let mut mapped = Vec::new();
        for _ in 0..50 {
            mapped.push(mapper.map(container, Proto::Tcp, ip, 0).unwrap());
        }
        assert_eq!(mapper.len(), 50, "round {}", round);
        for m in mapped {
            mapper.unmap(m.host_ip, m.host_port, m.proto).unwrap();
        }
        assert!(mapper.is_empty());
    }
}

/// Concurrent insert/lookup/delete churn over the id trie.
#[test]
fn stress_truncindex_churn() {
    let _lock = STRESS_TEST_LOCK.lock();
    let index = Arc::new(TruncIndex::new());

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let index = Arc::clone(&index);
        handles.push(std::thread::spawn(move || {
            for i in 0..200u32 {
                let id = format!("{:04x}{:04x}{}", t, i, "0".repeat(56));
                index.insert(&id).unwrap();
                assert_eq!(index.get(&id[..12]).unwrap(), id);
                if i % 2 == 0 {
                    index.delete(&id).unwrap();
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // Half of each thread's ids remain.
    assert_eq!(index.len(), 4 * 100);
}

/// Parallel jobs through one engine, including re-entrant dispatch.
#[test]
fn stress_engine_parallel_dispatch() {
    let _lock = STRESS_TEST_LOCK.lock();
    let eng = Engine::new();
    eng.register(
        "double",
        Arc::new(|job: &mut sandboxd::engine::Job| {
            let n: i64 = job.arg(0).and_then(|a| a.parse().ok()).unwrap_or(0);
            use std::io::Write;
            let _ = write!(job.stdout, "{}", n * 2);
            Status::Ok
        }),
    )
    .unwrap();
    eng.register(
        "quadruple",
        Arc::new(|job: &mut sandboxd::engine::Job| {
            let arg = job.arg(0).unwrap_or("0").to_string();
            let mut inner = job.engine().job("double", &[&arg]);
            if inner.run().is_err() {
                return Status::Err;
            }
            let doubled = inner.stdout.to_string_lossy();
            let mut inner = job.engine().job("double", &[&doubled]);
            if inner.run().is_err() {
                return Status::Err;
            }
            use std::io::Write;
            let _ = write!(job.stdout, "{}", inner.stdout.to_string_lossy());
            Status::Ok
        }),
    )
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..16i64 {
        let eng = Arc::clone(&eng);
        handles.push(std::thread::spawn(move || {
            let arg = i.to_string();
            let mut job = eng.job("quadruple", &[&arg]);
            job.run().unwrap();
            assert_eq!(job.stdout.to_string_lossy(), (i * 4).to_string());
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
