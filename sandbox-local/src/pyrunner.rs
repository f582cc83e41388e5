//! Generation of the Python runner entry point written into every
//! interpreter-backed sandbox.
//!
//! The runner re-applies the memory/CPU rlimits from inside the interpreter
//! and installs an `__import__` hook for the blocked-module list. The hook
//! runs in the same process as the submitted code and is advisory only —
//! the enforced layers are the manager's pre-spawn source scan and the
//! backend boundary itself. The allow list is intentionally not checked
//! here: stdlib modules import each other transitively, so a runtime
//! allow-list check would reject legitimate interpreter internals.

use std::collections::BTreeSet;

use sandbox::Restrictions;

const RUNNER_TEMPLATE: &str = r#"#!/usr/bin/env python3
"""Sandbox runner entry point (generated)."""

import builtins
import runpy
import sys
import traceback

BLOCKED_IMPORTS = frozenset(@BLOCKED@)
MAX_MEMORY_MB = @MAX_MEMORY_MB@
CPU_SECONDS = @CPU_SECONDS@


def _apply_limits():
    try:
        import resource
    except ImportError:
        return
    try:
        memory = MAX_MEMORY_MB * 1024 * 1024
        resource.setrlimit(resource.RLIMIT_DATA, (memory, memory))
        resource.setrlimit(resource.RLIMIT_CPU, (CPU_SECONDS, CPU_SECONDS))
    except (ValueError, OSError):
        pass


_real_import = builtins.__import__


def _checked_import(name, *args, **kwargs):
    top = name.partition(".")[0]
    if top in BLOCKED_IMPORTS:
        raise ImportError(f"import of '{top}' is blocked in this sandbox")
    return _real_import(name, *args, **kwargs)


def main():
    if len(sys.argv) < 2:
        print("usage: runner.py <entry-file>", file=sys.stderr)
        return 2
    _apply_limits()
    builtins.__import__ = _checked_import
    try:
        runpy.run_path(sys.argv[1], run_name="__main__")
    except ImportError as exc:
        print(f"sandbox: {exc}", file=sys.stderr)
        return 3
    except SystemExit as exc:
        if exc.code is None:
            return 0
        return exc.code if isinstance(exc.code, int) else 1
    except BaseException:
        traceback.print_exc()
        return 1
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

/// Render the runner for one sandbox's restrictions.
pub fn runner_source(restrictions: &Restrictions) -> String {
    let cpu_secs = sandbox::policy::effective_timeout(restrictions)
        .as_secs()
        .saturating_mul(2)
        .saturating_add(30);
    RUNNER_TEMPLATE
        .replace("@BLOCKED@", &python_string_list(&restrictions.blocked_imports))
        .replace("@MAX_MEMORY_MB@", &restrictions.max_memory_mb.to_string())
        .replace("@CPU_SECONDS@", &cpu_secs.to_string())
}

/// JSON string arrays are valid Python list literals.
fn python_string_list(modules: &BTreeSet<String>) -> String {
    serde_json::to_string(modules).unwrap_or_else(|_| "[]".to_string())
}
