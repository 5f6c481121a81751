// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: samgr command-line entrypoint

fn main() {
    samgr::run();
}
