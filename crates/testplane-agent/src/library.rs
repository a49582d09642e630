// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keyword libraries.
//!
//! A keyword is the smallest unit of work a worker exposes. The agent
//! serves one library per control channel; the test harness discovers and
//! invokes keywords through the server's facade as if they were local.

use async_trait::async_trait;
use serde_json::Value;

use testplane_proxy::KeywordResult;

/// The five operations of the keyword contract.
#[async_trait]
pub trait KeywordLibrary: Send + Sync {
    /// All keyword names this library serves.
    fn keyword_names(&self) -> Vec<String>;

    /// Execute one keyword. Long-running keywords are fine; the control
    /// channel stays responsive because stdout goes over the message channel.
    async fn run_keyword(&self, name: &str, args: Vec<Value>, kwargs: Value) -> KeywordResult;

    /// Positional argument names of a keyword.
    fn keyword_arguments(&self, name: &str) -> Vec<String> {
        let _ = name;
        vec!["args".to_string()]
    }

    /// Documentation string of a keyword.
    fn keyword_documentation(&self, name: &str) -> String {
        let _ = name;
        String::new()
    }

    /// Tags of a keyword.
    fn keyword_tags(&self, name: &str) -> Vec<String> {
        let _ = name;
        Vec::new()
    }
}

/// Test doubles shared by the agent tests and the server's end-to-end
/// suite.
pub mod testing {
    use super::*;

    /// Library with a single `echo` keyword.
    pub struct EchoLibrary;

    #[async_trait]
    impl KeywordLibrary for EchoLibrary {
        fn keyword_names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn run_keyword(
            &self,
            name: &str,
            args: Vec<Value>,
            _kwargs: Value,
        ) -> KeywordResult {
            match name {
                "echo" => KeywordResult::pass(Value::Array(args)),
                other => KeywordResult::fail(format!("unknown keyword '{}'", other)),
            }
        }

        fn keyword_documentation(&self, name: &str) -> String {
            match name {
                "echo" => "Returns its arguments unchanged.".to_string(),
                _ => String::new(),
            }
        }
    }
}
