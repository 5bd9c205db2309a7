use super::*;

fn add(dst: u32, a: u32, b: u32) -> Instruction {
    Instruction::new(Opcode::Add, Reg(dst), Reg(a), Reg(b))
}

fn mul(dst: u32, a: u32, b: u32) -> Instruction {
    Instruction::new(Opcode::Mul, Reg(dst), Reg(a), Reg(b))
}

fn dsts(list: &InstList) -> Vec<u32> {
    list.iter().map(|(_, inst)| inst.dst.0).collect()
}

#[test]
fn test_reg_display() {
    assert_eq!(format!("{}", Reg(0)), "t0");
    assert_eq!(format!("{}", Reg(42)), "t42");
    assert!(Reg::ONE.is_constant());
    assert!(!Reg(2).is_constant());
}

#[test]
fn test_inst_display() {
    assert_eq!(format!("{}", add(3, 1, 2)), "t3 = ADD t1, t2");
    assert_eq!(
        format!(
            "{}",
            Instruction::with_imm(Opcode::Mul, Reg(4), Reg(4), Imm::Float(0.5))
        ),
        "t4 = MUL t4, f:0.5"
    );
    assert_eq!(format!("{}", Instruction::fill(Reg(7), None)), "t7 = FILL");
    assert_eq!(
        format!(
            "{}",
            Instruction::binary_imm(
                Opcode::Matmul,
                Reg(9),
                Reg(2),
                Reg(8),
                Imm::Int(MATMUL_TRANS_LHS)
            )
        ),
        "t9 = MATMUL t2, t8, i:1"
    );
}

#[test]
fn test_scel_defines_side_output() {
    let train = Instruction::scel(Reg(10), Reg(3), Reg(9), Some(Reg(11)));
    assert_eq!(train.defs().collect::<Vec<_>>(), vec![Reg(10), Reg(11)]);
    assert_eq!(train.uses().collect::<Vec<_>>(), vec![Reg(3), Reg(9)]);

    let infer = Instruction::scel(Reg(10), Reg(3), Reg(9), None);
    assert_eq!(infer.defs().collect::<Vec<_>>(), vec![Reg(10)]);

    // An integer immediate only names a register on LS_SCEL.
    let reduce = Instruction::with_imm(Opcode::Reduce, Reg(5), Reg(4), Imm::Int(REDUCE_BATCH));
    assert_eq!(reduce.defs().collect::<Vec<_>>(), vec![Reg(5)]);
}

#[test]
fn test_redefine() {
    let mut inst = Instruction::scel(Reg(10), Reg(3), Reg(9), Some(Reg(11)));
    assert!(inst.redefine(Reg(11), Reg(20)));
    assert_eq!(inst.dst, Reg(10));
    assert_eq!(inst.side_output(), Some(Reg(20)));
    assert!(inst.redefine(Reg(10), Reg(21)));
    assert_eq!(inst.dst, Reg(21));
    assert!(!inst.redefine(Reg(3), Reg(22)));
}

#[test]
fn test_list_append_and_delete() {
    let mut list = InstList::new();
    let a = list.append(add(3, 1, 2));
    let b = list.append(add(4, 1, 2));
    let c = list.append(add(5, 1, 2));
    assert_eq!(list.len(), 3);

    // middle
    list.delete(b);
    assert_eq!(dsts(&list), vec![3, 5]);
    assert!(!list.contains(b));
    assert!(list.contains(a));

    // head
    list.delete(a);
    assert_eq!(dsts(&list), vec![5]);
    assert_eq!(list.head(), Some(c));

    // tail, leaving the list empty
    list.delete(c);
    assert!(list.is_empty());
    assert_eq!(list.head(), None);

    // appending after draining links from scratch
    list.append(add(6, 1, 2));
    assert_eq!(dsts(&list), vec![6]);
    assert_eq!(list.capacity(), 4);
}

#[test]
#[should_panic(expected = "deleted twice")]
fn test_list_double_delete_panics() {
    let mut list = InstList::new();
    let a = list.append(add(3, 1, 2));
    list.delete(a);
    list.delete(a);
}

#[test]
fn test_flatten_matches_traversal() {
    let mut p = Program::new();
    for i in 0..6 {
        p.append(add(10 + i, 1, 2));
    }
    let mut insts = p.take_insts();
    let ids = insts.ids();
    insts.delete(ids[1]);
    insts.delete(ids[4]);
    p.restore_insts(insts);

    let batch = p.flatten();
    assert_eq!(batch.len(), p.len());
    let walked: Vec<Instruction> = p.insts().iter().map(|(_, i)| *i).collect();
    assert_eq!(batch, walked);
    assert_eq!(
        batch.iter().map(|i| i.dst.0).collect::<Vec<_>>(),
        vec![10, 12, 13, 15]
    );
}

#[test]
fn test_flatten_empty_program() {
    assert!(Program::new().flatten().is_empty());
}

#[test]
fn test_fingerprint_tracks_content() {
    let a: InstList = [add(3, 1, 2), mul(4, 3, 3)].into_iter().collect();
    let b: InstList = [add(3, 1, 2), mul(4, 3, 3)].into_iter().collect();
    let c: InstList = [add(3, 1, 2), mul(4, 3, 2)].into_iter().collect();
    assert_eq!(program::fingerprint(&a), program::fingerprint(&b));
    assert_ne!(program::fingerprint(&a), program::fingerprint(&c));

    // Float and integer immediates with equal bits must still differ.
    let f = Instruction::with_imm(Opcode::Mul, Reg(4), Reg(3), Imm::Float(0.0));
    let i = Instruction::with_imm(Opcode::Mul, Reg(4), Reg(3), Imm::Int(0));
    assert_ne!(f.encode(), i.encode());
}

#[test]
fn test_dump_format() {
    let mut p = Program::new();
    p.inputs.push(Reg(2));
    p.labels.push(Reg(3));
    p.outputs.push(Reg(6));
    p.append(Instruction::new(Opcode::Matmul, Reg(5), Reg(2), Reg(4)));
    p.append(Instruction::with_imm(
        Opcode::Mul,
        Reg(6),
        Reg(5),
        Imm::Float(0.25),
    ));
    insta::assert_snapshot!(p.dump(), @r"
    program:
    {  // inputs 2 }
    {  // labels 3 }
    {  // outputs 6 }
    {  // weights (empty) }
    {  // grads (empty) }
    {  // states (empty) }
    {  // ops
      t5 = MATMUL t2, t4
      t6 = MUL t5, f:0.25
    }
    ");
}

#[test]
#[should_panic(expected = "detached")]
fn test_restore_into_touched_program_panics() {
    let mut p = Program::new();
    p.append(add(3, 1, 2));
    let insts = p.take_insts();
    p.append(add(4, 1, 2));
    p.restore_insts(insts);
}
