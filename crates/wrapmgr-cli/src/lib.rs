// Copyright 2025 wrapmgr Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # wrapmgr CLI
//!
//! Command-line front end for the wrapper manager.
//!
//! - `wrapmgr serve`: run the manager (RPC front, optional admin HTTP)
//! - `wrapmgr status`: print pool status as JSON
//! - `wrapmgr m3u8 <adam_id>`, `wrapmgr lyrics <adam_id>`: one-off lookups
//! - `wrapmgr login <username>`, `wrapmgr logout <username>`: account control
//!
//! Arguments are parsed with `argh`; options left unset fall back to
//! `WRAPMGR_*` environment variables.

pub mod args;
