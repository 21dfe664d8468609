//! # decomp-cache
//!
//! A content-addressed cache for Java decompiler output. Classes whose bytes and whose
//! super-type hierarchy are unchanged since an earlier run are served from the cache;
//! only the rest are handed to the decompiler.
//!
//! ## Architecture
//!
//! - **hash**: sha256/sha1 digests of bytes and files
//! - **classfile**: class file header reader (name, super class, interfaces)
//! - **jar**: memory-mapped jar reading, jar writing, entry listing and copying
//! - **attributes**: per-file sidecar attributes recording hashes
//! - **class_entry**: class identity, own hash and hierarchy hash
//! - **walker**: groups a jar's classes with their inner classes
//! - **linemap**: decompiler line-number maps
//! - **cache**: the bounded persistent entry store (LMDB via heed)
//! - **dir_backend**: directory-tree store backend
//! - **processor**: prepares decompile jobs and reconciles their output with the cache
//! - **decompiler** / **cfr**: the external decompiler seam and its CFR implementation
//! - **cache_key**: base hash capturing decompiler identity and options
//! - **generate**: the sources-jar build step, cached or not
//! - **split**: client/server jar splitting
//! - **lock**: per-project process lock
//! - **copy**: parallel verified file copies

pub mod attributes;
pub mod cache;
pub mod cache_key;
pub mod cfr;
pub mod class_entry;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod copy;
pub mod decompiler;
pub mod dir_backend;
pub mod error;
pub mod generate;
pub mod hash;
pub mod jar;
pub mod linemap;
pub mod lock;
pub mod processor;
pub mod split;
pub mod walker;
