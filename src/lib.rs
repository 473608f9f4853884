//! # dredd-campaign
//!
//! `dredd-campaign` runs long, resumable mutation-testing campaigns against a
//! compiler built with Dredd mutation instrumentation. It is organized around:
//! - `campaign::tree`: the mutation tree and its incompatibility relation
//! - `campaign::harness`: where tests come from and how mutated runs are judged
//! - `campaign::workdir`: the shared directory that coordinates workers
//! - `campaign::controller`: the per-worker campaign loop
//!
//! Any number of workers, in one process or many, may point at the same work
//! directory; each test is evaluated once and each kill is recorded once.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod campaign;
pub mod prelude;
