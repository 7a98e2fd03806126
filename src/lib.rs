// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod config;
pub mod manager;
pub mod node;
pub mod properties;
pub mod scheduler;
mod sync;
