//! Structured jumps. `exit`, `continue`, `goto` and `return` are emitted as
//! `JMP` with a pending tag, preceded by a `DEC` that starts at zero and
//! grows by the stack words of every construct the jump leaves. Tags are
//! bound when the construct, label or function they target closes.

use super::{CompilationSession, CompileResult, Label, fail};
use crate::bytecode::compile_error::CompileErrorKind;
use crate::bytecode::op::{Construct, Instruction, JumpClass, JumpTag, LabelId, Opcode, Operand};
use crate::lexer::Span;

impl CompilationSession {
    pub(super) fn emit_jump(&mut self, class: JumpClass, depth: u32, span: Span) {
        if class != JumpClass::Return {
            self.emit_fixed(Instruction::op(Opcode::Dec, 0));
        }
        let tag = JumpTag {
            class,
            depth: depth.max(1),
        };
        let at = self.emit_fixed(Instruction::pending(Opcode::Jmp, tag));
        self.jump_sites.insert(at, (span, self.file));
    }

    /// Id of a label in the current function, created on first mention.
    pub(super) fn label_id(&mut self, name: &str, span: Span) -> LabelId {
        let Some(ctx) = self.ctx_mut() else {
            return LabelId(0);
        };
        let index = match ctx.labels.iter().position(|l| l.name == name) {
            Some(i) => i,
            None => {
                ctx.labels.push(Label {
                    name: name.to_string(),
                    pos: None,
                    span,
                });
                ctx.labels.len() - 1
            }
        };
        LabelId(index as u32)
    }

    pub(super) fn define_label(&mut self, name: &str, span: Span) -> CompileResult<()> {
        let LabelId(index) = self.label_id(name, span);
        let pos = self.here();
        let Some(label) = self
            .ctx_mut()
            .and_then(|ctx| ctx.labels.get_mut(index as usize))
        else {
            return Ok(());
        };
        if label.pos.is_some() {
            return fail(CompileErrorKind::DuplicateLabel(name.to_string()), span);
        }
        label.pos = Some(pos);
        label.span = span;
        Ok(())
    }

    fn label_pos(&self, id: LabelId) -> Option<usize> {
        self.ctx()
            .and_then(|ctx| ctx.labels.get(id.0 as usize))
            .and_then(|l| l.pos)
    }

    /// Binds the pending jumps emitted since `start` as a construct ends.
    /// Jumps that travel further have `words` added to their `DEC` and,
    /// when this construct counts toward them, one less level to cross.
    pub(super) fn close_construct(
        &mut self,
        start: usize,
        construct: Construct,
        exit_to: usize,
        continue_to: Option<usize>,
        words: i64,
    ) {
        let end = self.code.len();
        for idx in start..end {
            let Operand::Pending(tag) = self.code[idx].operand else {
                continue;
            };
            let target = match tag.class {
                JumpClass::Return => continue,
                JumpClass::Goto(label) => match self.label_pos(label) {
                    // a label at `start` sits in front of the construct
                    Some(pos) if pos > start && pos < end => {
                        self.patch(idx, pos);
                        continue;
                    }
                    _ => None,
                },
                JumpClass::ExitAny => Some(exit_to),
                JumpClass::Exit(c) if c == construct => Some(exit_to),
                JumpClass::ContinueAny => continue_to,
                JumpClass::Continue(c) if c == construct => continue_to,
                _ => None,
            };
            match target {
                Some(to) if tag.depth <= 1 => self.patch(idx, to),
                Some(_) => {
                    self.code[idx].operand = Operand::Pending(JumpTag {
                        depth: tag.depth - 1,
                        ..tag
                    });
                    self.unwind(idx, words);
                }
                None => self.unwind(idx, words),
            }
        }
    }

    /// Adds to the stack adjustment in front of a pending jump.
    fn unwind(&mut self, jump: usize, words: i64) {
        if words == 0 || jump == 0 {
            return;
        }
        let dec = &mut self.code[jump - 1];
        if let (Opcode::Dec, Operand::Value(n)) = (dec.op, dec.operand) {
            dec.operand = Operand::Value(n + words);
        }
    }

    /// Binds what is left at the end of a function body: returns go to the
    /// epilogue, gotos to their label. Anything else never found its
    /// target; it is reported and pointed at the epilogue.
    pub(super) fn resolve_function_jumps(&mut self, start: usize, epilogue: usize) {
        for idx in start..epilogue.min(self.code.len()) {
            let Operand::Pending(tag) = self.code[idx].operand else {
                continue;
            };
            let target = match tag.class {
                JumpClass::Return => Some(epilogue),
                JumpClass::Goto(label) => self.label_pos(label),
                _ => None,
            };
            if target.is_none() {
                let what = self.describe_jump(tag.class);
                let (span, file) = self
                    .jump_sites
                    .get(&idx)
                    .copied()
                    .unwrap_or((self.span, self.file));
                self.report_in(CompileErrorKind::OrphanedJump(what), span, file);
            }
            self.patch(idx, target.unwrap_or(epilogue));
            self.jump_sites.remove(&idx);
        }
    }

    fn describe_jump(&self, class: JumpClass) -> String {
        match class {
            JumpClass::Exit(c) => format!("'exit {}'", construct_name(c)),
            JumpClass::ExitAny => "'exit'".to_string(),
            JumpClass::Continue(c) => format!("'continue {}'", construct_name(c)),
            JumpClass::ContinueAny => "'continue'".to_string(),
            JumpClass::Return => "'return'".to_string(),
            JumpClass::Goto(id) => {
                let name = self
                    .ctx()
                    .and_then(|ctx| ctx.labels.get(id.0 as usize))
                    .map(|l| l.name.as_str())
                    .unwrap_or("?");
                format!("'goto {}'", name)
            }
        }
    }
}

fn construct_name(c: Construct) -> &'static str {
    match c {
        Construct::For => "for",
        Construct::Which => "which",
        Construct::Repeat => "repeat",
        Construct::While => "while",
        Construct::Do => "do",
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::{CompileOptions, compile_source};
    use crate::runtime::vm_bc::{Machine, MachineConfig};

    fn run(body: &str) -> i64 {
        let source = format!("function main(): integer {}", body);
        let out = match compile_source(&source, "jumps.ppp", &CompileOptions::default()) {
            Ok(out) => out,
            Err(failure) => panic!("{}", failure.render()),
        };
        let mut machine = Machine::new(MachineConfig::default());
        let summary = machine
            .run(&out.module.code, &mut Vec::new(), &mut std::io::empty())
            .unwrap();
        assert!(summary.leaks.is_empty(), "leaks: {:?}", summary.leaks);
        summary.exit_code
    }

    fn assert_error(body: &str, code: u32) {
        let source = format!("function main(): integer {}", body);
        let failure = compile_source(&source, "jumps.ppp", &CompileOptions::default()).unwrap_err();
        assert!(failure.codes().contains(&code), "{:?}", failure.codes());
    }

    #[test]
    fn test_exit_innermost() {
        assert_eq!(
            run("var i: integer; var n: integer;
                 begin
                    while 1 do begin
                        i++;
                        if i = 5 then exit;
                        n += i
                    end;
                    return n
                 end;"),
            10
        );
    }

    #[test]
    fn test_exit_out_of_nested_for_loops() {
        // leaving both loops has to drop the 4 words each one keeps
        assert_eq!(
            run("var i: integer; var j: integer; var hits: integer;
                 begin
                    for i := 1 to 10 do
                        for j := 1 to 10 do begin
                            hits++;
                            if i * j = 12 then exit for 2
                        end;
                    return hits * 100 + i * 10 + j
                 end;"),
            1600 + 20 + 6
        );
    }

    #[test]
    fn test_continue_skips_rest() {
        assert_eq!(
            run("var i: integer; var n: integer;
                 begin
                    for i := 1 to 10 do begin
                        if odd i then continue;
                        n += i
                    end;
                    return n
                 end;"),
            30
        );
    }

    #[test]
    fn test_named_exit_passes_through_which() {
        assert_eq!(
            run("var i: integer;
                 begin
                    repeat begin
                        i++;
                        which i begin
                            case 3: exit repeat;
                            case else: i += 0;
                        end
                    end;
                    return i
                 end;"),
            3
        );
    }

    #[test]
    fn test_goto_forward_and_backward() {
        assert_eq!(
            run("var n: integer;
                 begin
                    again:
                    n++;
                    if n < 4 then goto again;
                    goto done;
                    n := 100;
                    done:
                    return n
                 end;"),
            4
        );
    }

    #[test]
    fn test_goto_out_of_loop() {
        assert_eq!(
            run("var i: integer;
                 begin
                    for i := 1 to 100 do
                        if i = 7 then goto out;
                    out:
                    return i
                 end;"),
            7
        );
    }

    #[test]
    fn test_orphaned_jumps() {
        assert_error("begin exit; return 0 end;", 11600);
        assert_error("begin while 1 do exit for; return 0 end;", 11600);
        assert_error("begin goto nowhere; return 0 end;", 11600);
        assert_error("begin while 1 do continue function; return 0 end;", 11600);
        assert_error("begin a: a: return 0 end;", 4011);
    }

    #[test]
    fn test_one_error_per_orphaned_jump() {
        let source = "function main(): integer
             begin
                exit;
                goto nowhere;
                while 1 do exit for;
                repeat begin continue for; exit repeat end;
                continue;
                return 0
             end;";
        let failure = compile_source(source, "jumps.ppp", &CompileOptions::default()).unwrap_err();
        let orphans = failure.codes().iter().filter(|&&c| c == 11600).count();
        assert_eq!(orphans, 5, "{}", failure.render());
        assert_eq!(failure.error_count(), 5);
    }

    #[test]
    fn test_exit_function() {
        assert_eq!(
            run("var i: integer;
                 begin
                    while 1 do begin
                        i++;
                        if i = 9 then exit function
                    end;
                    return 0
                 end;"),
            0
        );
    }
}
