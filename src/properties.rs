// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-global key/value store backing property nodes.
//!
//! Property tunables are not files; on the target platform they live in a
//! system-wide property area owned by the init daemon. hintd only ever acts
//! as the single writer of the keys it manages, so a process-local table is
//! enough for the engine and for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::sync::NoPoison;

static PROPERTIES: Lazy<Mutex<HashMap<String, String>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn set_property(key: &str, value: &str) {
    let mut table = PROPERTIES.do_lock();
    table.insert(key.to_string(), value.to_string());
}

/// Returns the stored value, or `default` if the key has never been set.
pub fn get_property(key: &str, default: &str) -> String {
    let table = PROPERTIES.do_lock();
    match table.get(key) {
        Some(value) => value.clone(),
        None => default.to_string(),
    }
}
