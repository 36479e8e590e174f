//! Reconciler: computes the delta between the currently managed
//! program set and a new configuration, classifying each program and
//! emitting the minimum set of per-worker actions needed to converge.
//!
//! The Supervisor Core owns the actual worker records; the Reconciler is a
//! pure function over `(current_specs, new_specs, existing workers)` ->
//! `ReconcileActions`, so it can be unit tested without any process I/O,
//! the same separation `airssys-osl` draws between an `Operation` value and
//! the `OSExecutor` that carries it out.

use std::collections::BTreeMap;

use crate::config::ProgramSpec;
use crate::worker::WorkerKey;

/// One instruction for the Supervisor Core to carry out against its worker
/// map. The core is responsible for sequencing these through the state
/// machine; the reconciler only decides *what* must change.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Create a worker record in STOPPED; auto-start it if the program's
    /// `autostart` is true.
    CreateWorker { key: WorkerKey, autostart: bool },
    /// Stop a worker because its program was removed, or `numprocs` shrank.
    /// The worker record is deleted once it reaches a terminal state.
    RemoveWorker { key: WorkerKey },
    /// The program's fingerprint changed: stop (if running) then respawn
    /// with the new spec.
    RespawnWorker { key: WorkerKey },
    /// Only monitoring fields changed, or nothing did: leave the process
    /// alone. Still present so callers can assert zero-churn reloads.
    LeaveRunning { key: WorkerKey },
}

/// Computes the full set of actions to converge from `current` to `new`.
///
/// `existing_replicas` lists the replica indices currently tracked per
/// program (needed to compute grow/shrink deltas for `numprocs` changes on
/// unchanged programs, and to know which replicas to tear down on removal).
pub fn reconcile(
    current: &BTreeMap<String, ProgramSpec>,
    new: &BTreeMap<String, ProgramSpec>,
    existing_replicas: &BTreeMap<String, Vec<u32>>,
) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();

    for (name, spec) in new {
        match current.get(name) {
            None => {
                for replica in 0..spec.numprocs {
                    actions.push(ReconcileAction::CreateWorker {
                        key: WorkerKey::new(name.clone(), replica),
                        autostart: spec.autostart,
                    });
                }
            }
            Some(old_spec) => {
                let empty = Vec::new();
                let replicas = existing_replicas.get(name).unwrap_or(&empty);
                if old_spec.fingerprint() != spec.fingerprint() {
                    for &replica in replicas {
                        if replica < spec.numprocs {
                            actions.push(ReconcileAction::RespawnWorker {
                                key: WorkerKey::new(name.clone(), replica),
                            });
                        } else {
                            actions.push(ReconcileAction::RemoveWorker {
                                key: WorkerKey::new(name.clone(), replica),
                            });
                        }
                    }
                    for replica in replicas.len() as u32..spec.numprocs {
                        actions.push(ReconcileAction::CreateWorker {
                            key: WorkerKey::new(name.clone(), replica),
                            autostart: spec.autostart,
                        });
                    }
                } else {
                    for &replica in replicas {
                        if replica < spec.numprocs {
                            actions.push(ReconcileAction::LeaveRunning {
                                key: WorkerKey::new(name.clone(), replica),
                            });
                        } else {
                            actions.push(ReconcileAction::RemoveWorker {
                                key: WorkerKey::new(name.clone(), replica),
                            });
                        }
                    }
                    for replica in replicas.len() as u32..spec.numprocs {
                        actions.push(ReconcileAction::CreateWorker {
                            key: WorkerKey::new(name.clone(), replica),
                            autostart: spec.autostart,
                        });
                    }
                }
            }
        }
    }

    for (name, _) in current {
        if !new.contains_key(name) {
            let empty = Vec::new();
            let replicas = existing_replicas.get(name).unwrap_or(&empty);
            for &replica in replicas {
                actions.push(ReconcileAction::RemoveWorker {
                    key: WorkerKey::new(name.clone(), replica),
                });
            }
        }
    }

    actions
}
