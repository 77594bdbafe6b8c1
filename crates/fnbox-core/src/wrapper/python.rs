use super::CodeWrapper;

pub struct PythonWrapper;

// `main` may be a coroutine function; its result is driven with asyncio.run.
const TEMPLATE: &str = r###"import asyncio
import inspect
import json
import os
import sys

RESULT_START = "##RESULT_START##"
RESULT_END = "##RESULT_END##"
USER_CODE = __FNBOX_USER_CODE__


def _load_entry_point():
    namespace = {"__name__": "__fnbox_function__"}
    exec(compile(USER_CODE, "function.py", "exec"), namespace)
    entry = namespace.get("main")
    if not callable(entry):
        raise NameError("function does not define a callable 'main'")
    return entry


def _run():
    entry = _load_entry_point()
    raw = os.environ.get("INPUT")
    payload = json.loads(raw) if raw else None
    result = entry(payload)
    if inspect.iscoroutine(result):
        result = asyncio.run(result)
    return result


try:
    _line = json.dumps({"result": _run()}, allow_nan=False)
except BaseException as exc:
    _line = json.dumps({"error": str(exc) or type(exc).__name__})

sys.stdout.flush()
sys.stdout.write("\n" + RESULT_START + "\n" + _line + "\n" + RESULT_END + "\n")
sys.stdout.flush()
"###;

impl CodeWrapper for PythonWrapper {
    fn file_extension(&self) -> &'static str {
        "py"
    }

    fn template(&self) -> &'static str {
        TEMPLATE
    }
}
