// src/io/socketcan/mod.rs
//
// SocketCAN adapter for Linux native CAN interfaces.
//
// The interface must be up before the bridge opens it, either configured by
// the system:
//   sudo ip link set can0 up type can bitrate 500000
// or by the bridge itself with `--configure-interface`.
//
// This module is only functional on Linux.

mod reader;

pub use reader::SocketCanBus;
