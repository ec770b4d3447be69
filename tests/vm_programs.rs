//! Flow VM behavior over assembled programs.

use flowgate::vm::{
    MatchCase, MatchKind, MatchPattern, NativeRegistry, Opcode, ProgramBuilder, VmError,
};

fn registry() -> NativeRegistry {
    NativeRegistry::new()
}

#[test]
fn addition_program_terminates_true() {
    // NCONST r0, 10; NCONST r1, 20; NADD r2, r0, r1; EXIT r2
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 3);
    let ten = b.add_integer(10);
    let twenty = b.add_integer(20);
    b.emit(Opcode::NConst, 0, ten, 0);
    b.emit(Opcode::NConst, 1, twenty, 0);
    b.emit(Opcode::NAdd, 2, 0, 1);
    b.emit(Opcode::Exit, 2, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(2).as_int(), 30);
}

#[test]
fn zero_exit_terminates_false() {
    // NCONST r0, 0; EXIT r0
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 1);
    let zero = b.add_integer(0);
    b.emit(Opcode::NConst, 0, zero, 0);
    b.emit(Opcode::Exit, 0, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(!runner.run());
    assert!(runner.fault().is_none());
}

#[test]
fn conditional_jumps_follow_register_truth() {
    // r0 = 1; JZ r0 -> else; r1 = 10; EXIT 1 / else: r1 = 20; EXIT 1
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    b.emit(Opcode::IMov, 0, 1, 0); // 0
    b.emit(Opcode::Jz, 0, 4, 0); // 1
    b.emit(Opcode::IMov, 1, 10, 0); // 2
    b.emit(Opcode::Exit, 1, 0, 0); // 3
    b.emit(Opcode::IMov, 1, 20, 0); // 4
    b.emit(Opcode::Exit, 1, 0, 0); // 5
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(1).as_int(), 10);
}

#[test]
fn prefix_match_highest_priority_wins() {
    // subject in r0; two overlapping prefixes; first in program order wins
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    let subject = b.add_string("/static/img/logo.png");
    b.emit(Opcode::SConst, 0, subject, 0); // 0
    b.emit(Opcode::Nop, 0, 0, 0); // 1: patched to SMATCHBEG
    let t_first = b.emit(Opcode::IMov, 1, 1, 0); // 2
    b.emit(Opcode::Exit, 1, 0, 0); // 3
    let t_second = b.emit(Opcode::IMov, 1, 2, 0); // 4
    b.emit(Opcode::Exit, 1, 0, 0); // 5
    let t_default = b.emit(Opcode::IMov, 1, 99, 0); // 6
    b.emit(Opcode::Exit, 1, 0, 0); // 7
    let table = b.add_match_table(
        MatchKind::Prefix,
        t_default,
        vec![
            MatchCase {
                pattern: MatchPattern::Literal("/static".into()),
                target: t_first,
            },
            MatchCase {
                pattern: MatchPattern::Literal("/static/img".into()),
                target: t_second,
            },
        ],
    );
    b.patch(1, Opcode::SMatchBeg, 0, table, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(1).as_int(), 1);
}

#[test]
fn unmatched_subject_takes_default_target() {
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    let subject = b.add_string("/nothing-matches");
    b.emit(Opcode::SConst, 0, subject, 0); // 0
    b.emit(Opcode::Nop, 0, 0, 0); // 1: patched to SMATCHEQ
    let t_case = b.emit(Opcode::IMov, 1, 1, 0); // 2
    b.emit(Opcode::Exit, 1, 0, 0); // 3
    let t_default = b.emit(Opcode::IMov, 1, 42, 0); // 4
    b.emit(Opcode::Exit, 1, 0, 0); // 5
    let table = b.add_match_table(
        MatchKind::Equal,
        t_default,
        vec![MatchCase {
            pattern: MatchPattern::Literal("/index".into()),
            target: t_case,
        }],
    );
    b.patch(1, Opcode::SMatchEq, 0, table, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(1).as_int(), 42);
}

#[test]
fn suffix_match_dispatch() {
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    let subject = b.add_string("/theme/site.css");
    b.emit(Opcode::SConst, 0, subject, 0); // 0
    b.emit(Opcode::Nop, 0, 0, 0); // 1: patched to SMATCHEND
    let t_html = b.emit(Opcode::IMov, 1, 1, 0); // 2
    b.emit(Opcode::Exit, 1, 0, 0); // 3
    let t_css = b.emit(Opcode::IMov, 1, 2, 0); // 4
    b.emit(Opcode::Exit, 1, 0, 0); // 5
    let t_default = b.emit(Opcode::IMov, 1, 99, 0); // 6
    b.emit(Opcode::Exit, 1, 0, 0); // 7
    let table = b.add_match_table(
        MatchKind::Suffix,
        t_default,
        vec![
            MatchCase {
                pattern: MatchPattern::Literal(".html".into()),
                target: t_html,
            },
            MatchCase {
                pattern: MatchPattern::Literal(".css".into()),
                target: t_css,
            },
        ],
    );
    b.patch(1, Opcode::SMatchEnd, 0, table, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(1).as_int(), 2);
}

#[test]
fn pincidr_across_families_and_prefix_boundaries() {
    let cases: &[(&str, &str, bool)] = &[
        ("10.0.0.1", "10.0.0.0/8", true),
        ("10.255.255.255", "10.0.0.0/8", true),
        ("11.0.0.0", "10.0.0.0/8", false),
        ("192.168.1.1", "192.168.1.0/31", true),
        ("192.168.1.2", "192.168.1.0/31", false),
        ("192.168.1.1", "0.0.0.0/0", true),
        ("2001:db8::1", "2001:db8::/32", true),
        ("2001:db9::1", "2001:db8::/32", false),
        ("2001:db8::1", "::/0", true),
        ("10.0.0.1", "2001:db8::/32", false),
    ];

    for (ip, cidr, expected) in cases {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let ip_idx = b.add_ipaddr(ip.parse().unwrap());
        let cidr_idx = b.add_cidr(cidr.parse().unwrap());
        b.emit(Opcode::PConst, 0, ip_idx, 0);
        b.emit(Opcode::CConst, 1, cidr_idx, 0);
        b.emit(Opcode::PInCidr, 2, 0, 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(
            runner.register(2).as_int() != 0,
            *expected,
            "{ip} in {cidr}"
        );
    }
}

#[test]
fn division_by_zero_is_a_fault_not_zero() {
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    b.emit(Opcode::IMov, 0, 7, 0);
    b.emit(Opcode::IMov, 1, 0, 0);
    b.emit(Opcode::NRem, 0, 0, 1);
    b.emit(Opcode::Exit, 1, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(!runner.run());
    assert!(matches!(
        runner.fault(),
        Some(VmError::DivisionByZero { .. })
    ));
}

#[test]
fn string_to_int_parse_failure_yields_zero() {
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    let garbage = b.add_string("not-a-number");
    b.emit(Opcode::SConst, 0, garbage, 0);
    b.emit(Opcode::S2I, 1, 0, 0);
    b.emit(Opcode::Exit, 1, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(1).as_int(), 0);
    assert!(runner.fault().is_none());
}

#[test]
fn string_pipeline_substring_length_concat() {
    // r2 = substr("/api/users", 0, 4); r3 = r2 + "/x"; r4 = len(r3)
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 7);
    let path = b.add_string("/api/users");
    let suffix = b.add_string("/x");
    b.emit(Opcode::SConst, 0, path, 0);
    b.emit(Opcode::IMov, 5, 0, 0); // offset
    b.emit(Opcode::IMov, 6, 4, 0); // count
    b.emit(Opcode::SSubStr, 2, 0, 5);
    b.emit(Opcode::SConst, 1, suffix, 0);
    b.emit(Opcode::SAdd, 3, 2, 1);
    b.emit(Opcode::SLen, 4, 3, 0);
    b.emit(Opcode::Exit, 1, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register_str(2), "/api");
    assert_eq!(runner.register_str(3), "/api/x");
    assert_eq!(runner.register(4).as_int(), 6);
}

#[test]
fn string_ops_address_bytes_not_chars() {
    // "€10 café" is 8 characters but 11 bytes ("€" = 3, "é" = 2)
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 7);
    let subject = b.add_string("€10 café");
    b.emit(Opcode::SConst, 0, subject, 0);
    b.emit(Opcode::SLen, 2, 0, 0);
    b.emit(Opcode::IMov, 3, 0, 0);
    b.emit(Opcode::IMov, 4, 3, 0);
    b.emit(Opcode::SSubStr, 1, 0, 3);
    b.emit(Opcode::IMov, 3, 4, 0);
    b.emit(Opcode::IMov, 4, 4, 0);
    b.emit(Opcode::SSubStr, 5, 0, 3);
    // offset near the end, count past it: clamps to the tail
    b.emit(Opcode::IMov, 3, 9, 0);
    b.emit(Opcode::IMov, 4, 10, 0);
    b.emit(Opcode::SSubStr, 6, 0, 3);
    b.emit(Opcode::Exit, 1, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
    assert_eq!(runner.register(2).as_int(), 11);
    assert_eq!(runner.register_str(1), "€");
    assert_eq!(runner.register_str(5), "0 ca");
    assert_eq!(runner.register_str(6), "é");
}

#[test]
fn handler_native_short_circuits_with_true() {
    let mut registry = NativeRegistry::new();
    registry.register_handler("deny", |p| {
        p.set_result_bool(true);
    });

    let mut b = ProgramBuilder::new();
    b.add_handler("main", 1);
    let deny = b.add_native_handler("deny", "B");
    b.emit(Opcode::Handler, deny, 0, 0);
    // unreachable in practice
    b.emit(Opcode::Exit, 0, 0, 0);
    let program = b.build(&registry).unwrap();

    let mut runner = program.handler("main").unwrap().create_runner();
    assert!(runner.run());
}

#[test]
fn every_handler_terminates_or_faults() {
    // an unconditional loop trips the instruction budget instead of
    // hanging the caller
    let mut b = ProgramBuilder::new();
    b.add_handler("spin", 1);
    b.emit(Opcode::Jmp, 0, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut runner = program.handler("spin").unwrap().create_runner();
    runner.set_instruction_budget(100_000);
    assert!(!runner.run());
    assert!(matches!(runner.fault(), Some(VmError::StackExhausted)));
}

#[test]
fn multiple_handlers_share_one_program() {
    let mut b = ProgramBuilder::new();
    b.add_handler("accept", 1);
    b.emit(Opcode::Exit, 1, 0, 0);
    b.add_handler("reject", 1);
    b.emit(Opcode::Exit, 0, 0, 0);
    let program = b.build(&registry()).unwrap();

    let mut accept = program.handler("accept").unwrap().create_runner();
    let mut reject = program.handler("reject").unwrap().create_runner();
    assert!(accept.run());
    assert!(!reject.run());
}
