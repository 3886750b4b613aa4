//! Managers shared across threads

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::setup;
use ndscope_core::{ManagerState, NDArray, NDManager, ParamBag, Resource};

#[test]
fn test_concurrent_close_releases_once() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let mut arrays = Vec::new();
    for _ in 0..4 {
        let child = root.new_sub_manager().unwrap();
        for _ in 0..16 {
            arrays.push(child.zeros([8]).unwrap());
        }
    }

    let barrier = Arc::new(Barrier::new(8));
    let closers: Vec<_> = (0..8)
        .map(|_| {
            let root = root.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let result = root.close();
                // Whoever returns has seen the cascade finish
                (result, root.state())
            })
        })
        .collect();

    for closer in closers {
        let (result, state) = closer.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(state, ManagerState::Closed);
    }

    assert!(arrays.iter().all(NDArray::is_released));
    assert_eq!(engine.max_release_calls(), 1);
    assert_eq!(engine.live_handles(), 0);
}

#[test]
fn test_allocation_racing_close_leaves_nothing_behind() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let target = root.new_sub_manager().unwrap();
    let barrier = Arc::new(Barrier::new(5));

    let allocators: Vec<_> = (0..4)
        .map(|_| {
            let target = target.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut created = Vec::new();
                loop {
                    match target.ones([4]) {
                        Ok(array) => created.push(array),
                        Err(err) => {
                            assert!(err.is_closed_manager());
                            return created;
                        }
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    while target.resource_count() < 32 {
        thread::yield_now();
    }
    root.close().unwrap();

    let created: Vec<NDArray> = allocators
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    // Every allocation that succeeded was attached before the snapshot and
    // released by the cascade; those that lost the race were never returned
    assert!(created.len() >= 32);
    assert!(created.iter().all(NDArray::is_released));
    assert_eq!(engine.live_handles(), 0);
    assert_eq!(engine.max_release_calls(), 1);
}

#[test]
fn test_attach_racing_close_either_lands_or_fails() {
    let (_engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let source = registry.new_base_manager().unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let arrays: Vec<NDArray> = (0..64).map(|_| source.zeros([1]).unwrap()).collect();
    for array in &arrays {
        source.detach_array(array);
    }

    let attacher = {
        let root = root.clone();
        let arrays = arrays.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            arrays
                .iter()
                .map(|array| root.attach_array(array).is_ok())
                .collect::<Vec<bool>>()
        })
    };

    barrier.wait();
    root.close().unwrap();
    let landed = attacher.join().unwrap();

    for (array, attached) in arrays.iter().zip(landed) {
        // Attached means released by the cascade; rejected means still ours
        assert_eq!(array.is_released(), attached);
        if !attached {
            array.close().unwrap();
        }
    }
}

#[test]
fn test_parallel_sub_managers() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || {
                root.with_scope(|scope| {
                    let a = scope.full([16], i as f64)?;
                    let b = scope.ones([16])?;
                    let sum = scope.invoke("add", &[&a, &b], &Default::default())?;
                    sum[0].to_vec::<f32>()
                })
            })
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        let values = worker.join().unwrap().unwrap();
        assert_eq!(values, vec![i as f32 + 1.0; 16]);
    }

    assert_eq!(root.child_count(), 0);
    assert_eq!(engine.live_handles(), 0);
    root.close().unwrap();
}

#[test]
fn test_sibling_closes_do_not_interfere() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let children: Vec<_> = (0..6)
        .map(|_| {
            let child = root.new_sub_manager().unwrap();
            child.zeros([4]).unwrap();
            child.new_sub_manager().unwrap().zeros([4]).unwrap();
            child
        })
        .collect();

    let handles: Vec<_> = children
        .iter()
        .cloned()
        .map(|child| thread::spawn(move || child.close()))
        .collect();
    // The root closes concurrently with its children
    root.close().unwrap();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(children.iter().all(|c| c.state() == ManagerState::Closed));
    assert_eq!(engine.live_handles(), 0);
    assert_eq!(engine.max_release_calls(), 1);
}

#[test]
fn test_sub_manager_creation_racing_close() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let parent = root.new_sub_manager().unwrap();
    let barrier = Arc::new(Barrier::new(5));

    let creators: Vec<_> = (0..4)
        .map(|_| {
            let parent = parent.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut created = Vec::new();
                loop {
                    match parent.new_sub_manager() {
                        Ok(child) => {
                            child.zeros([2]).ok();
                            created.push(child);
                        }
                        Err(err) => {
                            assert!(err.is_closed_manager());
                            return created;
                        }
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    while parent.child_count() < 16 {
        thread::yield_now();
    }
    root.close().unwrap();

    let created: Vec<NDManager> = creators
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    // A child handed out before the cascade is closed by it; none escaped
    assert!(created.len() >= 16);
    assert!(created.iter().all(|c| c.state() == ManagerState::Closed));
    assert_eq!(parent.child_count(), 0);
    assert_eq!(engine.live_handles(), 0);
    assert_eq!(engine.max_release_calls(), 1);
}

#[test]
fn test_close_during_invoke_releases_every_output() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let worker = root.new_sub_manager().unwrap();
    let input = root.vector(&[1.0f32, 2.0, 3.0]).unwrap();

    let closer = worker.clone();
    engine.after_next_invoke(move || {
        thread::spawn(move || closer.close())
            .join()
            .unwrap()
            .unwrap();
    });

    let params = ParamBag::new().with("parts", 3i64);
    let err = worker.invoke("split", &[&input], &params).unwrap_err();
    assert!(err.is_closed_manager());

    let produced = engine.produced();
    assert_eq!(produced.len(), 3);
    for handle in produced {
        assert_eq!(engine.release_calls(handle), 1);
    }
    assert_eq!(worker.resource_count(), 0);

    // Only the input is still alive
    assert_eq!(engine.live_handles(), 1);
    root.close().unwrap();
    assert_eq!(engine.live_handles(), 0);
}

#[test]
fn test_multi_output_invoke_attaches_every_part() {
    let (engine, registry) = setup();
    let root = registry.new_base_manager().unwrap();
    let input = root.vector(&[4i32, 5]).unwrap();

    let params = ParamBag::new().with("parts", 2i64);
    let parts = root.invoke("split", &[&input], &params).unwrap();
    assert_eq!(parts.len(), 2);
    for part in parts.iter() {
        assert!(root.contains(&part.uid().to_string()));
        assert_eq!(part.to_vec::<i32>().unwrap(), vec![4, 5]);
    }

    root.close().unwrap();
    assert_eq!(engine.live_handles(), 0);
}
