// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform abstractions for the emulator: Unix error plumbing and host
//! signal mask manipulation.

// UNSAFETY: Calls to libc functions to interact with low level primitives.
#![expect(unsafe_code)]

pub mod unix;
