/*
 * Created on Tue Jan 09 2024
 *
 * This file is a part of Scened
 * Scened is a free and open-source replicated scene-graph store that
 * provides ACID multi-shard transactions over a tree of nodes without
 * compromising on consistency or recoverability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Scened
//!
//! The `scened` crate (or the `server` folder) is the scene-graph store server. Clients submit
//! scene operations (tree edits and property writes) against a logical tree of nodes; the engine
//! replicates them across shards through a per-shard consensus log, orders concurrent work with
//! hybrid logical clocks and commits cross-shard transactions with a parallel-commit protocol.
//! See the `engine` module for the subsystem documentation.

#[macro_use]
mod engine;

use {
    crate::engine::{
        cluster::{Cluster, ClusterServices},
        config::{self, ConfigMode},
    },
    env_logger::Builder,
    libscene::VERSION,
    std::{env, process},
    tokio::signal,
};

fn main() {
    Builder::new()
        .parse_filters(&env::var("SCENED_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let config = match config::resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("startup failure: {e}");
            process::exit(0x01);
        }
    };
    if config.mode == ConfigMode::Dev {
        log::warn!("running in dev mode; the cluster will not tolerate replica loss");
    }
    log::info!(
        "starting scened v{VERSION} with {} shard(s), {} replica(s) per shard",
        config.shards,
        config.replicas_per_shard
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("server")
        .enable_all()
        .build()
        .unwrap();
    let exit_code = runtime.block_on(async move {
        let cluster = match Cluster::bootstrap(&config) {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to bootstrap the cluster: {e}");
                return 0x01;
            }
        };
        let services = ClusterServices::start(cluster.clone());
        log::info!("all shard appliers online; accepting work");
        let _ = signal::ctrl_c().await;
        log::info!("termination signal received. shutting down");
        services.shutdown().await;
        match cluster.close() {
            Ok(()) => 0x00,
            Err(e) => {
                log::error!("shutdown failure: {e}");
                0x10
            }
        }
    });
    drop(runtime);
    if exit_code == 0 {
        println!("Goodbye :)");
    }
    process::exit(exit_code);
}
