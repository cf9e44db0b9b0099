/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod agent;
pub mod callback_server;
pub mod clap_args;
pub mod config;
pub mod definition;
pub mod engine;
pub mod lifecycle;
pub mod orchestrator;
pub mod report;
pub mod stats;
