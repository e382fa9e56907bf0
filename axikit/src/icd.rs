//! The data-driven command engine.
//!
//! An ICD document names the board's parameters, commands and sequences.
//! Executing a command walks its `send` schema to build a frame (packing
//! literals, splicing parameter values, file contents and caller arrays),
//! ships it over the command transport, and walks the `recv` schema over the
//! reply to refresh the parameter store. The document is JSON; its order is
//! meaningful (commands fire in document order when looked up by parameter),
//! which is why the json parser keeps object order.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::api::KitConfig;
use crate::frame::{self, HEAD_LEN};
use crate::transport::{CmdTransport, ReplyMode};
use crate::{Error, Result};

mod expr;
use expr::Num;

/// Splices the contents of the file parameter in play.
pub const FILE_FLAG: &str = "__file__";
/// Splices the byte length of the file parameter in play, as a u32.
pub const FILE_LENGTH_FLAG: &str = "__filelength__";
const ARRAY_FLAG: &str = "__array__";

const DEFAULT_ICD: &str = include_str!("icd/default_icd.json");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    File,
    FileLength,
}

impl TypeTag {
    pub fn from_name(name: &str) -> Result<TypeTag> {
        Ok(match name {
            "uint8" => TypeTag::U8,
            "int8" => TypeTag::I8,
            "uint16" => TypeTag::U16,
            "int16" => TypeTag::I16,
            "uint32" => TypeTag::U32,
            "int32" => TypeTag::I32,
            "float" => TypeTag::F32,
            "double" => TypeTag::F64,
            "file" => TypeTag::File,
            "file_length" => TypeTag::FileLength,
            other => return Err(Error::Schema(format!("unknown type tag '{}'", other))),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::U8 => "uint8",
            TypeTag::I8 => "int8",
            TypeTag::U16 => "uint16",
            TypeTag::I16 => "int16",
            TypeTag::U32 => "uint32",
            TypeTag::I32 => "int32",
            TypeTag::F32 => "float",
            TypeTag::F64 => "double",
            TypeTag::File => "file",
            TypeTag::FileLength => "file_length",
        }
    }

    /// Packed width in a frame. A `file` splice has no fixed width.
    pub fn size(&self) -> usize {
        match self {
            TypeTag::U8 | TypeTag::I8 => 1,
            TypeTag::U16 | TypeTag::I16 => 2,
            TypeTag::U32 | TypeTag::I32 | TypeTag::F32 | TypeTag::FileLength => 4,
            TypeTag::F64 => 8,
            TypeTag::File => 0,
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, TypeTag::F32 | TypeTag::F64)
    }

    fn is_file(&self) -> bool {
        matches!(self, TypeTag::File | TypeTag::FileLength)
    }
}

/// A parameter's current value. Numeric parameters hold `Int`/`Float`; the
/// file flavors hold the path as `Text`.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn from_json(v: &Value) -> Result<ParamValue> {
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else {
                    Ok(ParamValue::Float(n.as_f64().unwrap_or(0.0)))
                }
            }
            Value::String(s) => Ok(ParamValue::Text(s.clone())),
            other => Err(Error::Schema(format!("unsupported value {}", other))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ParamValue::Int(i) => Value::from(*i),
            ParamValue::Float(f) => Value::from(*f),
            ParamValue::Text(s) => Value::from(s.clone()),
        }
    }

    /// Numeric view, parsing `0x`/`0b` prefixed and decimal text.
    fn as_num(&self) -> Result<Num> {
        match self {
            ParamValue::Int(i) => Ok(Num::Int(*i)),
            ParamValue::Float(f) => Ok(Num::Float(*f)),
            ParamValue::Text(s) => parse_text_num(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

fn parse_text_num(s: &str) -> Result<Num> {
    let parse_radix = |digits: &str, radix: u32| {
        i64::from_str_radix(digits, radix)
            .map(Num::Int)
            .map_err(|_| Error::Schema(format!("'{}' is not a number", s)))
    };
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        parse_radix(hex, 16)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        parse_radix(bin, 2)
    } else if s.contains('.') {
        s.parse::<f64>()
            .map(Num::Float)
            .map_err(|_| Error::Schema(format!("'{}' is not a number", s)))
    } else {
        s.parse::<i64>()
            .map(Num::Int)
            .map_err(|_| Error::Schema(format!("'{}' is not a number", s)))
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub tag: TypeTag,
    pub value: ParamValue,
    pub expr: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
enum FieldElem {
    Literal {
        tag: TypeTag,
        value: ParamValue,
        expr: Option<String>,
    },
    ParamRef(String),
    FileData,
    FileLength,
    Array(usize),
    Inline(String),
}

struct CmdDesc {
    send: Vec<FieldElem>,
    recv: Vec<FieldElem>,
}

/// Parsed ICD document plus the live parameter store.
pub struct IcdEngine {
    params: HashMap<String, Param>,
    param_order: Vec<String>,
    commands: Vec<(String, CmdDesc)>,
    index: HashMap<String, usize>,
    sequences: Vec<(String, Vec<FieldElem>)>,
    check_recv_head: bool,
}

impl IcdEngine {
    pub fn new() -> IcdEngine {
        IcdEngine {
            params: HashMap::new(),
            param_order: Vec::new(),
            commands: Vec::new(),
            index: HashMap::new(),
            sequences: Vec::new(),
            check_recv_head: true,
        }
    }

    /// Load the document named by the config (or the bundled default) and
    /// latch the reply-parse mode.
    pub fn config(&mut self, cfg: &KitConfig) -> Result<()> {
        self.check_recv_head = cfg.check_recv_head;
        match &cfg.icd_path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    Error::Schema(format!("icd {} unavailable: {}", path.display(), e))
                })?;
                self.load_str(&text)?;
                log::info!("icd loaded from {}", path.display());
            }
            None => {
                self.load_str(DEFAULT_ICD)?;
                log::info!("bundled default icd loaded");
            }
        }
        Ok(())
    }

    /// Parse and validate a document; the engine is only replaced when the
    /// whole document is good.
    pub fn load_str(&mut self, text: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(text)?;
        let root = doc
            .as_object()
            .ok_or_else(|| Error::Schema("document root must be an object".to_string()))?;

        let mut params = HashMap::new();
        let mut param_order = Vec::new();
        for (name, entry) in obj_section(root, "param")? {
            let arr = entry
                .as_array()
                .filter(|a| a.len() >= 2)
                .ok_or_else(|| Error::Schema(format!("param '{}' must be [tag, value]", name)))?;
            let tag = TypeTag::from_name(arr[0].as_str().ok_or_else(|| {
                Error::Schema(format!("param '{}' tag must be a string", name))
            })?)?;
            let expr = parse_expr_slot(arr.get(2), &format!("param '{}'", name))?;
            params.insert(
                name.clone(),
                Param {
                    tag,
                    value: ParamValue::from_json(&arr[1])?,
                    expr,
                },
            );
            param_order.push(name.clone());
        }

        let mut sequences = Vec::new();
        for (name, entry) in obj_section(root, "sequence")? {
            let arr = entry
                .as_array()
                .ok_or_else(|| Error::Schema(format!("sequence '{}' must be a list", name)))?;
            let mut elems = Vec::new();
            for v in arr {
                let elem = parse_elem(v, &format!("sequence '{}'", name))?;
                match elem {
                    FieldElem::Literal { .. } | FieldElem::ParamRef(_) => elems.push(elem),
                    _ => {
                        return Err(Error::Schema(format!(
                            "sequence '{}' may only hold literals and parameter names",
                            name
                        )))
                    }
                }
            }
            sequences.push((name.clone(), elems));
        }

        let mut commands = Vec::new();
        let mut index = HashMap::new();
        for (name, entry) in obj_section(root, "command")? {
            let obj = entry
                .as_object()
                .ok_or_else(|| Error::Schema(format!("command '{}' must be an object", name)))?;
            let send = elem_list(obj, "send", name)?;
            let recv = elem_list(obj, "recv", name)?;
            for elem in &send {
                if let FieldElem::Inline(seq) = elem {
                    if !sequences.iter().any(|(n, _)| n == seq) {
                        return Err(Error::Schema(format!(
                            "command '{}' inlines unknown sequence '{}'",
                            name, seq
                        )));
                    }
                }
            }
            for elem in &recv {
                match elem {
                    FieldElem::Literal { tag, .. } if *tag != TypeTag::File => (),
                    FieldElem::ParamRef(p) => {
                        let param = params.get(p).ok_or_else(|| {
                            Error::Schema(format!(
                                "command '{}' receives into unknown parameter '{}'",
                                name, p
                            ))
                        })?;
                        if param.tag == TypeTag::File {
                            return Err(Error::Schema(format!(
                                "command '{}' cannot receive into file parameter '{}'",
                                name, p
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::Schema(format!(
                            "command '{}' recv schema may only hold sized literals and parameter names",
                            name
                        )))
                    }
                }
            }
            index.insert(name.clone(), commands.len());
            commands.push((name.clone(), CmdDesc { send, recv }));
        }

        self.params = params;
        self.param_order = param_order;
        self.commands = commands;
        self.index = index;
        self.sequences = sequences;
        Ok(())
    }

    /// Write the running document (current values included) back out.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut param = Map::new();
        for name in &self.param_order {
            let p = &self.params[name];
            let mut entry = vec![Value::from(p.tag.name()), p.value.to_json()];
            if let Some(e) = &p.expr {
                entry.push(Value::from(e.clone()));
            }
            param.insert(name.clone(), Value::Array(entry));
        }
        let mut command = Map::new();
        for (name, desc) in &self.commands {
            let mut obj = Map::new();
            obj.insert(
                "send".to_string(),
                Value::Array(desc.send.iter().map(elem_to_json).collect()),
            );
            obj.insert(
                "recv".to_string(),
                Value::Array(desc.recv.iter().map(elem_to_json).collect()),
            );
            command.insert(name.clone(), Value::Object(obj));
        }
        let mut sequence = Map::new();
        for (name, elems) in &self.sequences {
            sequence.insert(
                name.clone(),
                Value::Array(elems.iter().map(elem_to_json).collect()),
            );
        }
        let mut root = Map::new();
        root.insert("param".to_string(), Value::Object(param));
        root.insert("command".to_string(), Value::Object(command));
        root.insert("sequence".to_string(), Value::Object(sequence));
        fs::write(path, serde_json::to_string_pretty(&Value::Object(root))?)?;
        Ok(())
    }

    /// Set a parameter. Text values coerce: `0x…` as hex, `0b…` as binary, a
    /// decimal point as float (file parameters keep their text). An unknown
    /// name is created as a uint32.
    pub fn set_param(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into();
        let tag = self
            .params
            .get(name)
            .map(|p| p.tag)
            .unwrap_or(TypeTag::U32);
        let coerced = coerce(tag, value)?;
        match self.params.get_mut(name) {
            Some(p) => p.value = coerced,
            None => {
                log::warn!("parameter '{}' not in the document, created as uint32", name);
                self.params.insert(
                    name.to_string(),
                    Param {
                        tag,
                        value: coerced,
                        expr: None,
                    },
                );
                self.param_order.push(name.to_string());
            }
        }
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Result<ParamValue> {
        self.params
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| Error::Schema(format!("unknown parameter '{}'", name)))
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Serialize a command's send schema into a wire frame, stamping the
    /// exchange serial and the real total length.
    pub fn fmt_command(&self, name: &str, serial: u32, arrays: &[&[u8]]) -> Result<Vec<u8>> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Error::Schema(format!("unknown command '{}'", name)))?;
        let mut out = Vec::new();
        let mut file_in_play: Option<String> = None;
        for elem in &self.commands[idx].1.send {
            self.pack_elem(elem, name, arrays, &mut file_in_play, true, &mut out)?;
        }
        if out.len() < HEAD_LEN {
            return Err(Error::MalformedFrame(format!(
                "command '{}' serializes to {} bytes, below the header size",
                name,
                out.len()
            )));
        }
        frame::stamp_serial(&mut out, serial);
        frame::stamp_len(&mut out);
        Ok(out)
    }

    fn pack_elem(
        &self,
        elem: &FieldElem,
        cmd: &str,
        arrays: &[&[u8]],
        file_in_play: &mut Option<String>,
        allow_inline: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match elem {
            FieldElem::Literal { tag, value, expr } => {
                if tag.is_file() {
                    if let ParamValue::Text(path) = value {
                        *file_in_play = Some(path.clone());
                    }
                }
                out.extend_from_slice(&pack_value(*tag, value, expr.as_deref(), cmd)?);
            }
            FieldElem::ParamRef(name) => match self.params.get(name) {
                Some(p) => {
                    if p.tag.is_file() {
                        if let ParamValue::Text(path) = &p.value {
                            *file_in_play = Some(path.clone());
                        }
                    }
                    out.extend_from_slice(&pack_value(p.tag, &p.value, p.expr.as_deref(), cmd)?);
                }
                None => {
                    log::warn!("command '{}' names missing parameter '{}'", cmd, name);
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            },
            FieldElem::FileData => {
                let path = file_in_play.as_ref().ok_or_else(|| no_file(cmd))?;
                out.extend_from_slice(&read_file(path, cmd)?);
            }
            FieldElem::FileLength => {
                let path = file_in_play.as_ref().ok_or_else(|| no_file(cmd))?;
                let len = read_file(path, cmd)?.len() as u32;
                out.extend_from_slice(&len.to_le_bytes());
            }
            FieldElem::Array(n) => {
                let data = arrays.get(*n).ok_or_else(|| Error::Command {
                    name: cmd.to_string(),
                    detail: format!("no caller array {}", n),
                })?;
                out.extend_from_slice(data);
            }
            FieldElem::Inline(seq) => {
                if !allow_inline {
                    return Err(Error::Schema(format!(
                        "nested sequence expansion in command '{}'",
                        cmd
                    )));
                }
                let elems = self
                    .sequences
                    .iter()
                    .find(|(n, _)| n == seq)
                    .map(|(_, e)| e)
                    .ok_or_else(|| Error::Schema(format!("unknown sequence '{}'", seq)))?;
                for inner in elems {
                    self.pack_elem(inner, cmd, arrays, file_in_play, false, out)?;
                }
            }
        }
        Ok(())
    }

    /// Reply length when the head is not trusted: the summed field sizes.
    fn recv_len(&self, idx: usize) -> Result<usize> {
        let (name, desc) = &self.commands[idx];
        let mut len = 0;
        for elem in &desc.recv {
            len += match elem {
                FieldElem::Literal { tag, .. } => tag.size(),
                FieldElem::ParamRef(p) => self
                    .params
                    .get(p)
                    .ok_or_else(|| {
                        Error::Schema(format!("unknown parameter '{}' in '{}'", p, name))
                    })?
                    .tag
                    .size(),
                _ => 0,
            };
        }
        Ok(len)
    }

    /// Walk the recv schema over a reply; returns the parameter updates
    /// without applying them.
    fn parse_recv(&self, idx: usize, reply: &[u8]) -> Result<Vec<(String, ParamValue)>> {
        let (name, desc) = &self.commands[idx];
        let (elems, mut cursor) = if self.check_recv_head {
            // the first four recv fields describe the verified header
            (&desc.recv[4..], HEAD_LEN)
        } else {
            (&desc.recv[..], 0)
        };
        let mut updates = Vec::new();
        for elem in elems {
            match elem {
                FieldElem::Literal { tag, .. } => cursor += tag.size(),
                FieldElem::ParamRef(p) => {
                    let param = self.params.get(p).ok_or_else(|| {
                        Error::Schema(format!("unknown parameter '{}' in '{}'", p, name))
                    })?;
                    let size = param.tag.size();
                    if cursor + size > reply.len() {
                        return Err(Error::Command {
                            name: name.clone(),
                            detail: format!(
                                "reply of {} bytes ends inside field '{}'",
                                reply.len(),
                                p
                            ),
                        });
                    }
                    updates.push((p.clone(), decode(param.tag, &reply[cursor..cursor + size])));
                    cursor += size;
                }
                _ => (),
            }
        }
        Ok(updates)
    }

    /// Run one named command: serialize, exchange, refresh parameters. The
    /// store is only touched when the whole reply parses.
    pub fn execute(
        &mut self,
        itf: &dyn CmdTransport,
        name: &str,
        arrays: &[&[u8]],
    ) -> Result<Vec<u8>> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Error::Schema(format!("unknown command '{}'", name)))?;
        let mode = if self.check_recv_head {
            if self.commands[idx].1.recv.len() < 5 {
                return Err(Error::Schema(format!(
                    "command '{}' recv schema has no room for a reply head",
                    name
                )));
            }
            ReplyMode::HeadChecked
        } else {
            ReplyMode::Fixed(self.recv_len(idx)?)
        };
        let request = self.fmt_command(name, itf.next_serial(), arrays)?;
        let reply = itf.transact(&request, mode)?;
        let updates = self.parse_recv(idx, &reply)?;
        for (pname, value) in updates {
            if let Some(p) = self.params.get_mut(&pname) {
                p.value = value;
            }
        }
        Ok(reply)
    }

    /// Execute every command whose send schema references the parameter (or
    /// the command of that name), in document order.
    pub fn execute_from_pname(
        &mut self,
        itf: &dyn CmdTransport,
        pname: &str,
    ) -> Result<Vec<Vec<u8>>> {
        let targets: Vec<String> = if self.index.contains_key(pname) {
            vec![pname.to_string()]
        } else {
            self.commands
                .iter()
                .filter(|(_, desc)| {
                    desc.send
                        .iter()
                        .any(|e| matches!(e, FieldElem::ParamRef(p) if p == pname))
                })
                .map(|(n, _)| n.clone())
                .collect()
        };
        let mut replies = Vec::new();
        for target in targets {
            replies.push(self.execute(itf, &target, &[])?);
        }
        Ok(replies)
    }
}

impl Default for IcdEngine {
    fn default() -> Self {
        IcdEngine::new()
    }
}

fn obj_section<'a>(root: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>> {
    root.get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Schema(format!("document section '{}' missing or not an object", key)))
}

fn parse_expr_slot(slot: Option<&Value>, what: &str) -> Result<Option<String>> {
    match slot {
        None => Ok(None),
        Some(Value::String(src)) => {
            expr::validate(src)?;
            Ok(Some(src.clone()))
        }
        Some(other) => Err(Error::Schema(format!(
            "{} expression must be a string, not {}",
            what, other
        ))),
    }
}

fn parse_elem(v: &Value, what: &str) -> Result<FieldElem> {
    match v {
        Value::Array(arr) => {
            if arr.len() < 2 {
                return Err(Error::Schema(format!(
                    "{} literal must be [tag, value, (expr)]",
                    what
                )));
            }
            let tag = TypeTag::from_name(arr[0].as_str().ok_or_else(|| {
                Error::Schema(format!("{} literal tag must be a string", what))
            })?)?;
            Ok(FieldElem::Literal {
                tag,
                value: ParamValue::from_json(&arr[1])?,
                expr: parse_expr_slot(arr.get(2), what)?,
            })
        }
        Value::String(s) => {
            if s == FILE_FLAG {
                Ok(FieldElem::FileData)
            } else if s == FILE_LENGTH_FLAG {
                Ok(FieldElem::FileLength)
            } else if let Some(n) = s.strip_prefix(ARRAY_FLAG) {
                let idx = n.parse::<usize>().map_err(|_| {
                    Error::Schema(format!("{} has bad array token '{}'", what, s))
                })?;
                Ok(FieldElem::Array(idx))
            } else if let Some(inner) = s.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
                Ok(FieldElem::Inline(inner.to_string()))
            } else {
                Ok(FieldElem::ParamRef(s.clone()))
            }
        }
        other => Err(Error::Schema(format!(
            "{} element {} is neither a literal nor a name",
            what, other
        ))),
    }
}

fn elem_list(obj: &Map<String, Value>, key: &str, cmd: &str) -> Result<Vec<FieldElem>> {
    let arr = obj
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Schema(format!("command '{}' is missing its {} list", cmd, key)))?;
    arr.iter()
        .map(|v| parse_elem(v, &format!("command '{}'", cmd)))
        .collect()
}

fn elem_to_json(elem: &FieldElem) -> Value {
    match elem {
        FieldElem::Literal { tag, value, expr } => {
            let mut arr = vec![Value::from(tag.name()), value.to_json()];
            if let Some(e) = expr {
                arr.push(Value::from(e.clone()));
            }
            Value::Array(arr)
        }
        FieldElem::ParamRef(name) => Value::from(name.clone()),
        FieldElem::FileData => Value::from(FILE_FLAG),
        FieldElem::FileLength => Value::from(FILE_LENGTH_FLAG),
        FieldElem::Array(n) => Value::from(format!("{}{}", ARRAY_FLAG, n)),
        FieldElem::Inline(name) => Value::from(format!("{{{{{}}}}}", name)),
    }
}

fn no_file(cmd: &str) -> Error {
    Error::Command {
        name: cmd.to_string(),
        detail: "no file parameter in play".to_string(),
    }
}

fn read_file(path: &str, cmd: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Command {
        name: cmd.to_string(),
        detail: format!("file '{}': {}", path, e),
    })
}

/// Apply the text-coercion rules and bring the value to the tag's kind.
fn coerce(tag: TypeTag, value: ParamValue) -> Result<ParamValue> {
    if tag.is_file() {
        return match value {
            ParamValue::Text(_) => Ok(value),
            other => Err(Error::Schema(format!(
                "file parameters take paths, not {:?}",
                other
            ))),
        };
    }
    let num = match &value {
        ParamValue::Text(s) => {
            let num = parse_text_num(s)?;
            // a decimal point keeps its float-ness even in integer fields
            if s.contains('.') && !s.starts_with("0x") && !s.starts_with("0b") {
                return Ok(ParamValue::Float(num.as_f64()));
            }
            num
        }
        ParamValue::Int(i) => Num::Int(*i),
        ParamValue::Float(f) => Num::Float(*f),
    };
    Ok(if tag.is_float() {
        ParamValue::Float(num.as_f64())
    } else {
        ParamValue::Int(num.trunc_i64())
    })
}

/// Pack one value little-endian per the tag, applying the scaling hook.
fn pack_value(tag: TypeTag, value: &ParamValue, expr: Option<&str>, cmd: &str) -> Result<Vec<u8>> {
    match tag {
        TypeTag::File => {
            let path = match value {
                ParamValue::Text(p) => p,
                _ => return Err(no_file(cmd)),
            };
            read_file(path, cmd)
        }
        TypeTag::FileLength => {
            let path = match value {
                ParamValue::Text(p) => p,
                _ => return Err(no_file(cmd)),
            };
            Ok((read_file(path, cmd)?.len() as u32).to_le_bytes().to_vec())
        }
        _ => {
            let mut num = value.as_num()?;
            if let Some(src) = expr {
                num = expr::eval(src, num)?;
            }
            Ok(match tag {
                TypeTag::U8 => (num.trunc_i64() as u8).to_le_bytes().to_vec(),
                TypeTag::I8 => (num.trunc_i64() as i8).to_le_bytes().to_vec(),
                TypeTag::U16 => (num.trunc_i64() as u16).to_le_bytes().to_vec(),
                TypeTag::I16 => (num.trunc_i64() as i16).to_le_bytes().to_vec(),
                TypeTag::U32 => (num.trunc_i64() as u32).to_le_bytes().to_vec(),
                TypeTag::I32 => (num.trunc_i64() as i32).to_le_bytes().to_vec(),
                TypeTag::F32 => (num.as_f64() as f32).to_le_bytes().to_vec(),
                TypeTag::F64 => num.as_f64().to_le_bytes().to_vec(),
                TypeTag::File | TypeTag::FileLength => unreachable!(),
            })
        }
    }
}

fn decode(tag: TypeTag, bytes: &[u8]) -> ParamValue {
    match tag {
        TypeTag::U8 => ParamValue::Int(bytes[0] as i64),
        TypeTag::I8 => ParamValue::Int(bytes[0] as i8 as i64),
        TypeTag::U16 => ParamValue::Int(u16::from_le_bytes(bytes.try_into().unwrap()) as i64),
        TypeTag::I16 => ParamValue::Int(i16::from_le_bytes(bytes.try_into().unwrap()) as i64),
        TypeTag::U32 | TypeTag::FileLength => {
            ParamValue::Int(u32::from_le_bytes(bytes.try_into().unwrap()) as i64)
        }
        TypeTag::I32 => ParamValue::Int(i32::from_le_bytes(bytes.try_into().unwrap()) as i64),
        TypeTag::F32 => ParamValue::Float(f32::from_le_bytes(bytes.try_into().unwrap()) as f64),
        TypeTag::F64 => ParamValue::Float(f64::from_le_bytes(bytes.try_into().unwrap())),
        TypeTag::File => ParamValue::Text(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHead, REPLY_MAGIC};
    use crate::transport::mock::MockCmd;
    use std::io::Write;

    fn engine(doc: &str) -> IcdEngine {
        let mut icd = IcdEngine::new();
        icd.load_str(doc).unwrap();
        icd
    }

    const SETFREQ_DOC: &str = r#"{
        "param": { "freq": ["uint32", 1000000] },
        "command": {
            "setfreq": {
                "send": [["uint32", "0x31"], ["uint32", 0], ["uint32", 0], ["uint32", 0], "freq"],
                "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x31"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
            }
        },
        "sequence": {}
    }"#;

    #[test]
    fn setfreq_serializes_to_the_literal_frame() {
        let icd = engine(SETFREQ_DOC);
        let frame = icd.fmt_command("setfreq", 0, &[]).unwrap();
        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[0..4], &[0x31, 0, 0, 0]);
        assert_eq!(&frame[12..16], &[20, 0, 0, 0]);
        assert_eq!(&frame[16..20], &[0x40, 0x42, 0x0F, 0x00]);
    }

    #[test]
    fn param_roundtrip_through_coercion() {
        let mut icd = engine(SETFREQ_DOC);
        icd.set_param("freq", "0x100").unwrap();
        assert_eq!(icd.get_param("freq").unwrap(), ParamValue::Int(0x100));
        icd.set_param("freq", "0b101").unwrap();
        assert_eq!(icd.get_param("freq").unwrap(), ParamValue::Int(5));
        icd.set_param("freq", "2.5").unwrap();
        assert_eq!(icd.get_param("freq").unwrap(), ParamValue::Float(2.5));
        icd.set_param("freq", 42u32).unwrap();
        assert_eq!(icd.get_param("freq").unwrap(), ParamValue::Int(42));
        // floats truncate into integer parameters
        icd.set_param("freq", 3.9).unwrap();
        assert_eq!(icd.get_param("freq").unwrap(), ParamValue::Int(3));
    }

    #[test]
    fn unknown_set_param_creates_a_uint32() {
        let mut icd = engine(SETFREQ_DOC);
        assert!(icd.get_param("gain").is_err());
        icd.set_param("gain", 7u32).unwrap();
        assert_eq!(icd.get_param("gain").unwrap(), ParamValue::Int(7));
    }

    #[test]
    fn execute_updates_the_store_from_the_reply() {
        const DOC: &str = r#"{
            "param": { "temp": ["int16", 0], "status": ["uint32", 0] },
            "command": {
                "poll": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 16]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 22], "status", "temp"]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = engine(DOC);
        let itf = MockCmd::new();
        itf.script(|req| {
            let req_head = FrameHead::unpack(req).unwrap();
            let mut reply = FrameHead {
                magic: REPLY_MAGIC,
                cmd_id: req_head.cmd_id,
                serial: req_head.serial,
                total_len: 22,
            }
            .pack()
            .to_vec();
            reply.extend_from_slice(&0x11u32.to_le_bytes());
            reply.extend_from_slice(&(-12i16).to_le_bytes());
            reply
        });
        icd.execute(&itf, "poll", &[]).unwrap();
        assert_eq!(icd.get_param("status").unwrap(), ParamValue::Int(0x11));
        assert_eq!(icd.get_param("temp").unwrap(), ParamValue::Int(-12));
        // the request went out with the echoed command id
        let sent = itf.sent.lock().unwrap();
        assert_eq!(FrameHead::unpack(&sent[0]).unwrap().cmd_id, 0x41);
    }

    #[test]
    fn failed_execute_leaves_the_store_untouched() {
        const DOC: &str = r#"{
            "param": { "status": ["uint32", 5] },
            "command": {
                "poll": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 16]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 20], "status"]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = engine(DOC);
        let itf = MockCmd::new();
        // reply announces a body it does not carry past the head
        itf.script(|req| {
            let req_head = FrameHead::unpack(req).unwrap();
            FrameHead {
                magic: REPLY_MAGIC,
                cmd_id: req_head.cmd_id,
                serial: req_head.serial,
                total_len: 16,
            }
            .pack()
            .to_vec()
        });
        assert!(matches!(
            icd.execute(&itf, "poll", &[]),
            Err(Error::Command { .. })
        ));
        assert_eq!(icd.get_param("status").unwrap(), ParamValue::Int(5));
    }

    #[test]
    fn unchecked_mode_reads_the_summed_length() {
        const DOC: &str = r#"{
            "param": { "status": ["uint32", 0] },
            "command": {
                "poll": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 16]],
                    "recv": ["status", ["uint16", 0]]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = engine(DOC);
        icd.check_recv_head = false;
        let itf = MockCmd::new();
        itf.script(|_| {
            let mut r = 0xAB01_0203u32.to_le_bytes().to_vec();
            r.extend_from_slice(&[0xFF, 0xFF]);
            r
        });
        icd.execute(&itf, "poll", &[]).unwrap();
        assert_eq!(icd.get_param("status").unwrap(), ParamValue::Int(0xAB01_0203));
    }

    #[test]
    fn file_tokens_splice_contents_and_length() {
        let mut fw = tempfile::NamedTempFile::new().unwrap();
        fw.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x55]).unwrap();
        let path = fw.path().to_str().unwrap().to_string();

        const DOC: &str = r#"{
            "param": { "image": ["file", ""] },
            "command": {
                "load": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x42"], ["uint32", 0], ["uint32", 0], "image", "__filelength__", "__file__"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x42"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = engine(DOC);
        icd.set_param("image", path.as_str()).unwrap();
        let frame = icd.fmt_command("load", 0, &[]).unwrap();
        // head(16) + contents-for-the-param-ref(5) + length(4) + contents(5)
        assert_eq!(frame.len(), 30);
        assert_eq!(u32::from_le_bytes(frame[12..16].try_into().unwrap()), 30);
        assert_eq!(&frame[16..21], &[0xDE, 0xAD, 0xBE, 0xEF, 0x55]);
        assert_eq!(u32::from_le_bytes(frame[21..25].try_into().unwrap()), 5);
        assert_eq!(&frame[25..30], &[0xDE, 0xAD, 0xBE, 0xEF, 0x55]);
    }

    #[test]
    fn file_token_without_a_file_parameter_fails() {
        const DOC: &str = r#"{
            "param": {},
            "command": {
                "load": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x42"], ["uint32", 0], ["uint32", 0], "__file__"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x42"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let icd = engine(DOC);
        assert!(matches!(
            icd.fmt_command("load", 0, &[]),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn arrays_splice_in_order() {
        const DOC: &str = r#"{
            "param": {},
            "command": {
                "burst": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x43"], ["uint32", 0], ["uint32", 0], "__array__0", "__array__1"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x43"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let icd = engine(DOC);
        let frame = icd
            .fmt_command("burst", 0, &[&[1, 2], &[3, 4, 5, 6]])
            .unwrap();
        assert_eq!(&frame[16..], &[1, 2, 3, 4, 5, 6]);
        assert!(matches!(
            icd.fmt_command("burst", 0, &[&[1, 2]]),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn expressions_scale_at_pack_time() {
        const DOC: &str = r#"{
            "param": { "gain": ["uint16", 4, "x*3"] },
            "command": {
                "set": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x44"], ["uint32", 0], ["uint32", 0], "gain", ["uint8", 10, "x+1"]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x44"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let icd = engine(DOC);
        let frame = icd.fmt_command("set", 0, &[]).unwrap();
        assert_eq!(&frame[16..18], &12u16.to_le_bytes());
        assert_eq!(frame[18], 11);
    }

    #[test]
    fn bad_expressions_fail_at_load() {
        const DOC: &str = r#"{
            "param": { "gain": ["uint16", 4, "import os"] },
            "command": {},
            "sequence": {}
        }"#;
        let mut icd = IcdEngine::new();
        assert!(matches!(icd.load_str(DOC), Err(Error::Schema(_))));
    }

    #[test]
    fn recv_into_unknown_parameter_fails_at_load() {
        const DOC: &str = r#"{
            "param": {},
            "command": {
                "poll": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 16]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x41"], ["uint32", 0], ["uint32", 20], "ghost"]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = IcdEngine::new();
        assert!(matches!(icd.load_str(DOC), Err(Error::Schema(_))));
    }

    #[test]
    fn sequence_inlines_from_the_store() {
        const DOC: &str = r#"{
            "param": { "step": ["uint16", 3] },
            "command": {
                "sweep": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x45"], ["uint32", 0], ["uint32", 0], "{{steps}}"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x45"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": { "steps": [["uint8", 1], "step", ["uint8", 2]] }
        }"#;
        let icd = engine(DOC);
        let frame = icd.fmt_command("sweep", 0, &[]).unwrap();
        assert_eq!(&frame[16..], &[1, 3, 0, 2]);
    }

    #[test]
    fn execute_from_pname_runs_matching_commands_in_order() {
        const DOC: &str = r#"{
            "param": { "freq": ["uint32", 1] },
            "command": {
                "second": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x52"], ["uint32", 0], ["uint32", 0], "freq"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x52"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                },
                "other": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x53"], ["uint32", 0], ["uint32", 16]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x53"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                },
                "first": {
                    "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x54"], ["uint32", 0], ["uint32", 0], "freq"],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x54"], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let mut icd = engine(DOC);
        let itf = MockCmd::new();
        let replies = icd.execute_from_pname(&itf, "freq").unwrap();
        assert_eq!(replies.len(), 2);
        let sent = itf.sent.lock().unwrap();
        let ids: Vec<u32> = sent
            .iter()
            .map(|f| FrameHead::unpack(f).unwrap().cmd_id)
            .collect();
        // document order: "second" is declared before "first"
        assert_eq!(ids, [0x52, 0x54]);
    }

    #[test]
    fn save_roundtrips_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("running.json");
        let mut icd = engine(SETFREQ_DOC);
        icd.set_param("freq", 777u32).unwrap();
        icd.save(&path).unwrap();

        let mut reloaded = IcdEngine::new();
        reloaded
            .load_str(&fs::read_to_string(&path).unwrap())
            .unwrap();
        assert_eq!(reloaded.get_param("freq").unwrap(), ParamValue::Int(777));
        let frame = reloaded.fmt_command("setfreq", 0, &[]).unwrap();
        assert_eq!(&frame[16..20], &777u32.to_le_bytes());
    }

    #[test]
    fn bundled_default_document_loads() {
        let mut icd = IcdEngine::new();
        icd.config(&KitConfig::default()).unwrap();
        assert!(icd.has_command("get_version"));
    }

    #[test]
    fn short_command_is_malformed() {
        const DOC: &str = r#"{
            "param": {},
            "command": {
                "stub": {
                    "send": [["uint32", 1]],
                    "recv": [["uint32", "0xCFCFCFCF"], ["uint32", 1], ["uint32", 0], ["uint32", 20], ["uint32", 0]]
                }
            },
            "sequence": {}
        }"#;
        let icd = engine(DOC);
        assert!(matches!(
            icd.fmt_command("stub", 0, &[]),
            Err(Error::MalformedFrame(_))
        ));
    }
}
