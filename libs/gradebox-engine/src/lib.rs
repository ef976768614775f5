//! Code execution and grading core.
//!
//! Two paths share the same building blocks:
//! - an interactive [`session::SessionManager`] driving the embedded interpreter,
//!   pausing whenever the program asks for input
//! - a [`harness::BatchHarness`] grading a program against test cases through a
//!   remote [`sandbox::Sandbox`]
//!
//! Learner code is always wrapped by [`scaffold`] first so reported error lines
//! can be mapped back to what the learner sees.

pub mod aggregator;
pub mod classifier;
pub mod diagnostics;
pub mod harness;
pub mod interpreter;
pub mod judge0;
pub mod python;
pub mod sandbox;
pub mod scaffold;
pub mod session;

pub use aggregator::{aggregate, describe, Aggregate};
pub use classifier::{classify, OutputFragment, OutputKind, RawOutputEvent};
pub use harness::{BatchEvent, BatchHarness, BatchObserver, BatchRun, Silent};
pub use interpreter::{Execution, Interpreter, InterpreterError, SharedInterpreter};
pub use judge0::HttpSandbox;
pub use python::PythonInterpreter;
pub use sandbox::{ExecutionOutcome, Sandbox, SandboxError, SandboxRequest, SandboxResponse};
pub use scaffold::{remap_error_line, wrap, ScaffoldMapping};
pub use session::{SessionError, SessionManager, SessionSnapshot, SessionState};
