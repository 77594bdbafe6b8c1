use super::CodeWrapper;

pub struct JavaScriptWrapper;

// The user source becomes the body of a Function taking CommonJS-style
// `module`, `exports` and `require`, so both a top-level `function main` and
// `module.exports.main` are found. Returned promises are awaited.
const TEMPLATE: &str = r###""use strict";

const RESULT_START = "##RESULT_START##";
const RESULT_END = "##RESULT_END##";
const USER_CODE = __FNBOX_USER_CODE__;

function emit(line) {
  process.stdout.write("\n" + RESULT_START + "\n" + line + "\n" + RESULT_END + "\n");
}

function describe(err) {
  if (err instanceof Error) {
    return err.message || err.name;
  }
  return String(err);
}

function loadEntryPoint() {
  const mod = { exports: {} };
  const load = new Function(
    "module",
    "exports",
    "require",
    USER_CODE + "\n;return typeof main === \"function\" ? main : module.exports.main;"
  );
  const entry = load(mod, mod.exports, require);
  if (typeof entry !== "function") {
    throw new Error("function does not define a callable 'main'");
  }
  return entry;
}

async function run() {
  const entry = loadEntryPoint();
  const raw = process.env.INPUT;
  const input = raw ? JSON.parse(raw) : null;
  const result = await entry(input);
  return result === undefined ? null : result;
}

run()
  .then((result) => emit(JSON.stringify({ result: result })))
  .catch((err) => emit(JSON.stringify({ error: describe(err) })));
"###;

impl CodeWrapper for JavaScriptWrapper {
    fn file_extension(&self) -> &'static str {
        "js"
    }

    fn template(&self) -> &'static str {
        TEMPLATE
    }
}
