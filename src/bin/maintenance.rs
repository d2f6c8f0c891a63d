//! Maintenance CLI: the only command-line surface this crate exposes.
//! The allocator and aggregator are library APIs; this binary just
//! drives the `aggregate` entry point against the in-memory reference
//! collaborators, for operators exercising a pool without writing a
//! harness of their own.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

use vos_core::aggregator::{self, Anchor, ContainerMeta, ObjMeta, ValueRecord};
use vos_core::external::NullObjectCache;
use vos_core::memstore::BTreeOrderedMap;

#[derive(Parser, Debug)]
#[command(name = "maintenance", about, version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the epoch aggregator against a pool/container/object/epoch range.
    Aggregate {
        #[arg(long)]
        pool: Uuid,
        #[arg(long)]
        cont: Uuid,
        /// Object id as `HI.LO` (two u64 halves of the 128-bit id).
        #[arg(long)]
        oid: String,
        /// Epoch range as `LO:HI`.
        #[arg(long)]
        epr: String,
        #[arg(long)]
        credits: u32,
    },
}

fn parse_oid(s: &str) -> Result<u128, String> {
    let (hi, lo) = s
        .split_once('.')
        .ok_or_else(|| format!("oid must be HI.LO, got {s:?}"))?;
    let hi: u64 = hi.parse().map_err(|_| format!("bad oid high half {hi:?}"))?;
    let lo: u64 = lo.parse().map_err(|_| format!("bad oid low half {lo:?}"))?;
    Ok(((hi as u128) << 64) | lo as u128)
}

fn parse_epr(s: &str) -> Result<(u64, u64), String> {
    let (lo, hi) = s
        .split_once(':')
        .ok_or_else(|| format!("epr must be LO:HI, got {s:?}"))?;
    let lo: u64 = lo.parse().map_err(|_| format!("bad epr low bound {lo:?}"))?;
    let hi: u64 = hi.parse().map_err(|_| format!("bad epr high bound {hi:?}"))?;
    Ok((lo, hi))
}

/// Fixture: the four composite-keyed trees and the object cache an
/// aggregation run needs, backed by the in-memory reference `OrderedMap`
/// (component C1 is out of scope for this crate; production tooling
/// would point this at a real pool's trees instead).
struct Fixture {
    obj_tree: BTreeOrderedMap<aggregator::ObjId, ObjMeta>,
    dkey_tree: BTreeOrderedMap<aggregator::DkeyKey, ()>,
    akey_tree: BTreeOrderedMap<aggregator::AkeyKey, ()>,
    value_tree: BTreeOrderedMap<aggregator::ValueKey, ValueRecord>,
    object_cache: NullObjectCache,
    container: ContainerMeta,
}

impl Fixture {
    fn empty() -> Self {
        Self {
            obj_tree: BTreeOrderedMap::new(),
            dkey_tree: BTreeOrderedMap::new(),
            akey_tree: BTreeOrderedMap::new(),
            value_tree: BTreeOrderedMap::new(),
            object_cache: NullObjectCache::default(),
            container: ContainerMeta::default(),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match args.command {
        Command::Aggregate {
            pool,
            cont,
            oid,
            epr,
            credits,
        } => run_aggregate(pool, cont, &oid, &epr, credits),
    }
}

fn run_aggregate(pool: Uuid, cont: Uuid, oid: &str, epr: &str, credits: u32) -> ExitCode {
    let oid = match parse_oid(oid) {
        Ok(v) => v,
        Err(msg) => {
            error!(%msg, "usage error");
            return ExitCode::from(2);
        }
    };
    let (epr_lo, epr_hi) = match parse_epr(epr) {
        Ok(v) => v,
        Err(msg) => {
            error!(%msg, "usage error");
            return ExitCode::from(2);
        }
    };

    info!(%pool, %cont, oid, epr_lo, epr_hi, credits, "starting aggregation run");

    let mut fixture = Fixture::empty();
    let mut remaining_credits = credits;
    let mut anchor = Anchor::default();
    // coh stands in for the container handle; this CLI has no real pool
    // to open one against, so the container UUID's low 64 bits serve as
    // a stable per-run identifier for the object cache's hold records.
    let coh = cont.as_u128() as u64;

    // A single run consumes at most `credits` worth of work and then
    // either finishes or pauses; resuming a paused run is the caller's
    // job (rerun with the same pool/cont/oid/epr and a fresh anchor
    // persisted between invocations, which this one-shot demo does not
    // do on its own).
    let finished = match aggregator::aggregate(
        &mut fixture.obj_tree,
        &mut fixture.dkey_tree,
        &mut fixture.akey_tree,
        &mut fixture.value_tree,
        &mut fixture.object_cache,
        &mut fixture.container,
        coh,
        Some(oid),
        epr_lo,
        epr_hi,
        &mut remaining_credits,
        &mut anchor,
    ) {
        Ok(finished) => finished,
        Err(err) => {
            error!(%err, "aggregation failed");
            return ExitCode::FAILURE;
        }
    };
    if finished {
        info!("aggregation finished");
    } else {
        info!("aggregation paused: credit budget exhausted before reaching the end of scope");
    }
    ExitCode::SUCCESS
}
