// SPDX-License-Identifier: Apache-2.0

pub mod harvest;
pub mod init;
pub mod publisher;
