//! Loom models of the lock-free stack's push/pop protocol.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --test loom_lfstack --release`.

#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;

use rudo_gcwork::{LfStack, NodeId, NodeSlab};

#[test]
fn loom_concurrent_push_then_drain() {
    loom::model(|| {
        let slab = Arc::new(NodeSlab::new(2));
        let stack = Arc::new(LfStack::new());

        let handles: Vec<_> = (0..2u32)
            .map(|i| {
                let slab = Arc::clone(&slab);
                let stack = Arc::clone(&stack);
                thread::spawn(move || stack.push(&*slab, NodeId::new(i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let a = stack.pop(&*slab).unwrap();
        let b = stack.pop(&*slab).unwrap();
        assert_ne!(a, b);
        assert!(stack.pop(&*slab).is_none());
    });
}

#[test]
fn loom_pop_races_with_repush() {
    loom::model(|| {
        let slab = Arc::new(NodeSlab::new(2));
        let stack = Arc::new(LfStack::new());
        stack.push(&*slab, NodeId::new(0));
        stack.push(&*slab, NodeId::new(1));

        // Pops a node and pushes it straight back: the ABA pattern.
        let recycler = {
            let slab = Arc::clone(&slab);
            let stack = Arc::clone(&stack);
            thread::spawn(move || {
                if let Some(id) = stack.pop(&*slab) {
                    stack.push(&*slab, id);
                }
            })
        };
        let popped = stack.pop(&*slab);
        recycler.join().unwrap();

        let mut seen: Vec<NodeId> = popped.into_iter().collect();
        while let Some(id) = stack.pop(&*slab) {
            assert!(!seen.contains(&id), "{id:?} reachable twice");
            seen.push(id);
        }
        assert_eq!(seen.len(), 2);
    });
}

#[test]
fn loom_push_publishes_prior_writes() {
    use loom::sync::atomic::{AtomicUsize, Ordering};

    loom::model(|| {
        let slab = Arc::new(NodeSlab::new(1));
        let stack = Arc::new(LfStack::new());
        let payload = Arc::new(AtomicUsize::new(0));

        let producer = {
            let slab = Arc::clone(&slab);
            let stack = Arc::clone(&stack);
            let payload = Arc::clone(&payload);
            thread::spawn(move || {
                payload.store(42, Ordering::Relaxed);
                stack.push(&*slab, NodeId::new(0));
            })
        };

        if stack.pop(&*slab).is_some() {
            assert_eq!(payload.load(Ordering::Relaxed), 42);
        }
        producer.join().unwrap();
    });
}
