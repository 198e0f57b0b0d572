use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use proptest::prelude::*;
use tagdoc_core::{
    ChangeKind, Command, CommandResult, DiagnosticKind, Document, Error, Format, Tree, Value, formats,
};

fn avfx() -> Arc<Format> {
    Arc::new(formats::avfx().expect("builtin avfx"))
}

// ---- byte builders (reversed tags, 4-byte alignment) ----

fn header(tag: &str, len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = tag.bytes().rev().collect();
    out.resize(4, 0);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out
}

fn blk(tag: &str, content: &[u8]) -> Vec<u8> {
    let mut out = header(tag, content.len());
    out.extend_from_slice(content);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

fn int(tag: &str, v: i32) -> Vec<u8> {
    blk(tag, &v.to_le_bytes())
}

fn cat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

fn container(content: &[u8]) -> Vec<u8> {
    let mut out = header("AVFX", content.len());
    out.extend_from_slice(content);
    out
}

fn padded(s: &str, len: usize, fill: u8) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    let pad = if s.is_empty() { 0 } else { fill };
    out.resize(len, pad);
    out
}

fn item_em(particle: i32) -> Vec<u8> {
    blk("ItEm", &cat(&[blk("bEnb", &[1]), int("PrNo", particle), int("LCnt", 1)]))
}

fn particle(kind: i32, texture: i32) -> Vec<u8> {
    let tc1 = blk("TC1", &cat(&[blk("bEna", &[1]), int("TxNo", texture)]));
    blk("Ptcl", &cat(&[int("PrVT", kind), int("Cnt", 1), tc1]))
}

/// Effect with one scheduler, timeline, binder and texture, two emitters and
/// two particles. `emitter1_extra` is appended to the second emitter's content.
fn sample_with(emitter1_extra: &[u8]) -> Vec<u8> {
    let scheduler = blk(
        "Schd",
        &cat(&[
            int("ItCn", 1),
            blk("Trgr", &cat(&[blk("bEna", &[1]), int("StTm", 0), int("TlNo", 0)])),
        ]),
    );
    let timeline = blk(
        "TmLn",
        &cat(&[
            int("LpSt", -1),
            int("LpEd", -1),
            blk("BnNo", &[255]),
            blk(
                "Item",
                &cat(&[
                    blk("bEna", &[1]),
                    int("StTm", 0),
                    int("EdTm", 30),
                    int("BdNo", -1),
                    int("EmNo", 1),
                ]),
            ),
        ]),
    );
    let emitter0 = blk(
        "Emit",
        &cat(&[blk("Sd", b"se\0"), int("EVT", 0), item_em(0), item_em(-1)]),
    );
    let mut e1 = cat(&[int("EVT", 1), item_em(1)]);
    e1.extend_from_slice(emitter1_extra);
    let emitter1 = blk("Emit", &e1);
    let binder = blk("Bind", &blk("BNam", &padded("Hello", 16, 0xFE)));
    let texture = blk("Tex", b"tex/a.atex\0");

    container(&cat(&[
        int("Ver", 0x2011_0913),
        blk("bDFP", &[1]),
        blk("RvSx", &1.0f32.to_le_bytes()),
        scheduler,
        timeline,
        emitter0,
        emitter1,
        particle(0, 0),
        particle(1, 0),
        binder,
        texture,
    ]))
}

fn sample() -> Vec<u8> {
    sample_with(&[])
}

fn open(bytes: &[u8]) -> Document {
    Document::parse(avfx(), bytes).expect("parse")
}

fn ints(doc: &Document, names: &str) -> Vec<i64> {
    let path = doc.tree().resolve(names).expect("path");
    doc.tree().field(&path).expect("field").value().as_ints().expect("ints").to_vec()
}

// ---- reading and writing ----

#[test]
fn unedited_document_round_trips() {
    let bytes = sample();
    let doc = open(&bytes);
    assert!(doc.diagnostics().is_empty(), "{:?}", doc.diagnostics());
    let v = doc.verification().expect("verified on open");
    assert!(v.verified, "{}", v.message);
    assert_eq!(v.message, "verified");
    assert_eq!(doc.serialize(), bytes);

    let lens: Vec<usize> = doc.tree().groups().iter().map(|g| g.len()).collect();
    assert_eq!(lens, vec![1, 1, 2, 2, 1, 1]);
    assert!(doc.tree().tail().is_empty());
}

#[test]
fn wrong_magic_is_rejected() {
    let mut bytes = sample();
    bytes[0] = b'Q';
    assert!(matches!(Document::parse(avfx(), &bytes), Err(Error::InvalidDocument(_))));
    assert!(matches!(Document::parse(avfx(), &[1, 2, 3]), Err(Error::InvalidDocument(_))));
}

#[test]
fn bytes_after_the_container_are_kept() {
    let mut bytes = sample();
    bytes.extend_from_slice(&[0, 0, 0xAB]);
    let doc = open(&bytes);
    assert_eq!(doc.tree().tail(), &[0u8, 0, 0xAB]);
    assert_eq!(doc.serialize(), bytes);
}

#[test]
fn unknown_span_is_kept_verbatim() {
    let unknown = blk("Zzzz", &[9, 8, 7, 6]);
    assert_eq!(unknown.len(), 12);
    let bytes = sample_with(&unknown);
    let doc = open(&bytes);

    let kinds: Vec<DiagnosticKind> = doc.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiagnosticKind::UnknownTag]);
    let emitter = &doc.tree().group_named("emitters").unwrap().get(1).unwrap().node;
    assert_eq!(emitter.trailing(), unknown.as_slice());
    assert_eq!(doc.serialize(), bytes);
}

#[test]
fn locked_block_missing_from_input_is_not_added() {
    // Ver cannot be matched behind an unknown block, so the whole root
    // content ends up as unrecognized bytes
    let content = cat(&[blk("Zzzz", &[1, 2, 3, 4]), int("Ver", 7)]);
    let bytes = container(&content);
    let doc = open(&bytes);
    let kinds: Vec<DiagnosticKind> = doc.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiagnosticKind::UnknownTag]);
    assert_eq!(doc.tree().root().trailing(), content.as_slice());
    let ver = doc.tree().resolve("Ver").unwrap();
    assert!(doc.tree().block(&ver).unwrap().is_absent());
    assert_eq!(doc.serialize(), bytes);
    assert!(doc.verification().unwrap().verified);

    // no Ver at all
    let bare = container(&blk("bDFP", &[1]));
    let mut doc = open(&bare);
    assert!(doc.diagnostics().is_empty());
    assert_eq!(doc.serialize(), bare);

    doc.set_field(ver.clone(), Value::Int(7)).unwrap();
    assert!(!doc.tree().block(&ver).unwrap().is_absent());
    assert_eq!(doc.serialize(), container(&cat(&[int("Ver", 7), blk("bDFP", &[1])])));
    assert!(doc.undo());
    assert_eq!(doc.serialize(), bare);
}

#[test]
fn irregular_padding_is_written_back() {
    let mut bytes = sample();
    // Sd holds 3 bytes, so one padding byte follows it
    let at = bytes.windows(4).position(|w| w == b"dS\0\0").unwrap() + 8 + 3;
    assert_eq!(bytes[at], 0);
    bytes[at] = 0xAA;

    let mut doc = open(&bytes);
    let kinds: Vec<DiagnosticKind> = doc.diagnostics().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiagnosticKind::NonZeroPadding]);
    assert!(doc.verification().unwrap().verified);
    assert_eq!(doc.serialize(), bytes);

    // a new size gets fresh zero padding
    let sd = doc.tree().resolve("Emit[0]/Sd").unwrap();
    doc.set_field(sd, Value::from("sound")).unwrap();
    let out = doc.serialize();
    let at = out.windows(4).position(|w| w == b"dS\0\0").unwrap() + 8;
    assert_eq!(&out[at..at + 8], b"sound\0\0\0");
    assert!(doc.undo());
    assert_eq!(doc.serialize(), bytes);
}

#[test]
fn malformed_entity_is_kept_raw() {
    // TC1 claims 100 bytes but only 12 follow inside the particle
    let broken = blk(
        "Ptcl",
        &cat(&[int("PrVT", 0), header("TC1", 100), blk("bEna", &[1]), vec![0; 4]]),
    );
    let good = sample();
    let prefix_len = good.len() - blk("Tex", b"tex/a.atex\0").len();
    let mut content = good[8..prefix_len].to_vec();
    content.extend_from_slice(&broken);
    content.extend_from_slice(&blk("Tex", b"tex/a.atex\0"));
    let bytes = container(&content);

    let doc = open(&bytes);
    assert!(
        doc.diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::MalformedData)
    );
    let particles = doc.tree().group_named("particles").unwrap();
    assert_eq!(particles.len(), 3);
    assert!(particles.get(2).unwrap().node.is_malformed());
    assert_eq!(doc.serialize(), bytes);
}

#[test]
fn padded_string_reads_and_writes_with_fill() {
    let mut doc = open(&sample());
    let path = doc.tree().resolve("Bind[0]/BNam").unwrap();
    assert_eq!(doc.tree().field(&path).unwrap().value(), &Value::from("Hello"));

    doc.set_field(path, Value::from("Hi")).unwrap();
    let out = doc.serialize();
    let mut expected = b"Hi\0".to_vec();
    expected.extend_from_slice(&[0xFE; 13]);
    assert!(out.windows(16).any(|w| w == expected.as_slice()));
    assert_eq!(out.len(), sample().len());
}

// ---- references ----

#[test]
fn references_resolve_to_entities() {
    let doc = open(&sample());
    let tree = doc.tree();
    let path = tree.resolve("Emit[0]/ItEm[0]/PrNo").unwrap();
    let first_particle = tree.group_named("particles").unwrap().id_at(0);
    assert_eq!(tree.field(&path).unwrap().links(), &[first_particle]);

    let none = tree.resolve("emitters[0]/ItEm[1]/PrNo").unwrap();
    assert_eq!(tree.field(&none).unwrap().links(), &[None::<tagdoc_core::EntityId>]);

    let sites = tree.link_sites(first_particle.unwrap());
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].path, path);
}

#[test]
fn removing_an_entity_clears_and_renumbers_references() {
    let original = sample();
    let mut doc = open(&original);
    let first = doc.tree().group_named("particles").unwrap().id_at(0).unwrap();

    doc.remove_entity(first).unwrap();
    assert_eq!(ints(&doc, "Emit[0]/ItEm[0]/PrNo"), vec![-1]);
    assert_eq!(ints(&doc, "Emit[1]/ItEm[0]/PrNo"), vec![0]);

    assert!(doc.undo());
    assert_eq!(ints(&doc, "Emit[0]/ItEm[0]/PrNo"), vec![0]);
    assert_eq!(ints(&doc, "Emit[1]/ItEm[0]/PrNo"), vec![1]);
    assert_eq!(doc.serialize(), original);
}

#[test]
fn out_of_range_reference_is_refused() {
    let original = sample();
    let mut doc = open(&original);
    let path = doc.tree().resolve("Emit[0]/ItEm[0]/PrNo").unwrap();
    let err = doc.set_field(path.clone(), Value::Int(7)).unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }));
    assert!(!doc.can_undo());
    assert_eq!(doc.serialize(), original);

    doc.set_field(path, Value::Int(1)).unwrap();
    assert_eq!(ints(&doc, "Emit[0]/ItEm[0]/PrNo"), vec![1]);
}

#[test]
fn set_reference_to_nothing_writes_sentinel() {
    let mut doc = open(&sample());
    let path = doc.tree().resolve("TmLn[0]/Item[0]/EmNo").unwrap();
    doc.set_reference(path, 0, None).unwrap();
    assert_eq!(ints(&doc, "TmLn[0]/Item[0]/EmNo"), vec![-1]);
    assert!(doc.undo());
    assert_eq!(ints(&doc, "TmLn[0]/Item[0]/EmNo"), vec![1]);
}

// ---- history ----

#[test]
fn undo_and_redo_are_inverse() {
    let original = sample();
    let mut doc = open(&original);
    let path = doc.tree().resolve("RvSx").unwrap();
    doc.set_field(path, Value::F32(2.5)).unwrap();
    let edited = doc.serialize();
    assert_ne!(edited, original);
    assert!(doc.undo_description().is_some_and(|d| d.starts_with("Set root/3")));

    assert!(doc.undo());
    assert_eq!(doc.serialize(), original);
    assert!(doc.redo());
    assert_eq!(doc.serialize(), edited);
    assert!(!doc.can_redo());
    assert!(!doc.redo());
}

#[test]
fn unassign_and_fresh_assign() {
    let original = sample();
    let mut doc = open(&original);
    let tc1 = doc.tree().resolve("Ptcl[0]/TC1").unwrap();

    doc.toggle_assigned(tc1.clone()).unwrap();
    assert!(!doc.tree().block(&tc1).unwrap().is_assigned());
    let without = doc.serialize();
    let tc1_len = blk("TC1", &cat(&[blk("bEna", &[1]), int("TxNo", 0)])).len();
    assert_eq!(without.len(), original.len() - tc1_len);

    // assigning again starts from defaults
    doc.toggle_assigned(tc1.clone()).unwrap();
    assert_eq!(ints(&doc, "Ptcl[0]/TC1/TxNo"), vec![-1]);
    let enabled = doc.tree().resolve("Ptcl[0]/TC1/bEna").unwrap();
    assert_eq!(doc.tree().field(&enabled).unwrap().value(), &Value::Bool(false));

    assert!(doc.undo());
    assert_eq!(doc.serialize(), without);
    assert!(doc.undo());
    assert_eq!(doc.serialize(), original);
    assert_eq!(ints(&doc, "Ptcl[0]/TC1/TxNo"), vec![0]);
}

#[test]
fn locked_blocks_cannot_be_removed() {
    let mut doc = open(&sample());
    let ver = doc.tree().resolve("Ver").unwrap();
    assert!(matches!(doc.toggle_assigned(ver), Err(Error::InvalidOperation(_))));
    assert!(!doc.can_undo());
}

#[test]
fn notifications_and_dirty_flag() {
    let mut doc = open(&sample());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let sub = doc.subscribe(move |c| sink.borrow_mut().push(c.kind));
    assert!(!doc.is_dirty());

    let path = doc.tree().resolve("Ver").unwrap();
    doc.set_field(path.clone(), Value::Int(1)).unwrap();
    assert!(doc.is_dirty());
    doc.mark_saved();
    assert!(!doc.is_dirty());
    assert!(doc.undo());
    assert!(doc.is_dirty());
    assert!(doc.redo());
    assert!(doc.is_dirty());

    assert_eq!(
        *seen.borrow(),
        vec![ChangeKind::Executed, ChangeKind::Undone, ChangeKind::Redone]
    );
    assert!(doc.unsubscribe(sub));
    doc.set_field(path, Value::Int(2)).unwrap();
    assert_eq!(seen.borrow().len(), 3);
}

// ---- entities ----

#[test]
fn duplicate_keeps_references() {
    let original = sample();
    let mut doc = open(&original);
    let first = doc.tree().group_named("particles").unwrap().id_at(0).unwrap();
    let copy = doc.duplicate_entity(first).unwrap();

    let particles = doc.tree().group_named("particles").unwrap();
    assert_eq!(particles.len(), 3);
    assert_eq!(particles.index_of(copy), Some(2));
    assert_eq!(ints(&doc, "Ptcl[2]/TC1/TxNo"), vec![0]);

    assert!(doc.undo());
    assert_eq!(doc.serialize(), original);
    assert!(doc.redo());
    assert_eq!(doc.tree().group_named("particles").unwrap().index_of(copy), Some(2));
}

#[test]
fn import_shifts_dependent_references() {
    let source = open(&sample());
    let emitter = source.tree().group_named("emitters").unwrap().id_at(0).unwrap();
    let blob = source.export_entity(emitter).unwrap();

    let mut doc = Document::new(avfx()).unwrap();
    for _ in 0..5 {
        doc.add_entity("particles").unwrap();
    }
    let ids = doc.import(&blob).unwrap();
    // emitter, its particle and that particle's texture
    assert_eq!(ids.len(), 3);

    assert_eq!(ints(&doc, "Emit[0]/ItEm[0]/PrNo"), vec![5]);
    assert_eq!(ints(&doc, "Emit[0]/ItEm[1]/PrNo"), vec![-1]);
    assert_eq!(ints(&doc, "Ptcl[5]/TC1/TxNo"), vec![0]);
    let path = doc.tree().resolve("Emit[0]/ItEm[0]/PrNo").unwrap();
    assert_eq!(doc.tree().field(&path).unwrap().links(), &[Some(ids[1])]);

    assert!(doc.undo());
    assert_eq!(doc.tree().group_named("particles").unwrap().len(), 5);
    assert!(doc.tree().group_named("emitters").unwrap().is_empty());
}

#[test]
fn importing_a_non_entity_is_an_unknown_tag() {
    let mut doc = open(&sample());
    let blob = int("Ver", 1);
    match doc.import(&blob) {
        Err(Error::UnknownTag { tag, offset }) => {
            assert_eq!(tag.as_str(), "Ver");
            assert_eq!(offset, 0);
        }
        other => panic!("expected an unknown tag, got {other:?}"),
    }
    assert!(!doc.can_undo());
}

/// An edit whose target has gone by the time it is replayed.
struct Stale {
    undo_fails: bool,
}

impl Stale {
    fn gone() -> Error {
        Error::CommandReplay {
            command: "stale edit".into(),
            reason: "target no longer exists".into(),
        }
    }
}

impl Command for Stale {
    fn description(&self) -> &str {
        "stale edit"
    }

    fn execute(&mut self, _tree: &mut Tree) -> CommandResult {
        Ok(())
    }

    fn undo(&mut self, _tree: &mut Tree) -> CommandResult {
        if self.undo_fails { Err(Self::gone()) } else { Ok(()) }
    }

    fn redo(&mut self, _tree: &mut Tree) -> CommandResult {
        Err(Self::gone())
    }
}

#[test]
fn failed_replay_drops_history() {
    let mut doc = open(&sample());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    doc.subscribe(move |c| sink.borrow_mut().push(c.kind));

    let ver = doc.tree().resolve("Ver").unwrap();
    doc.set_field(ver.clone(), Value::Int(1)).unwrap();
    doc.execute(Box::new(Stale { undo_fails: true })).unwrap();
    assert!(!doc.undo());
    assert!(!doc.can_undo());
    assert!(!doc.can_redo());
    // the older entry went with it; its edit stays applied
    assert_eq!(doc.tree().field(&ver).unwrap().value(), &Value::Int(1));

    doc.execute(Box::new(Stale { undo_fails: false })).unwrap();
    assert!(doc.undo());
    assert!(doc.can_redo());
    assert!(!doc.redo());
    assert!(!doc.can_redo());
    assert!(!doc.can_undo());

    use ChangeKind::*;
    assert_eq!(*seen.borrow(), vec![Executed, Executed, Dropped, Executed, Undone, Dropped]);
}

#[test]
fn added_entities_use_defaults() {
    let mut doc = Document::new(avfx()).unwrap();
    let id = doc.add_entity("binders").unwrap();
    assert_eq!(doc.tree().locate(id).map(|(_, i)| i), Some(0));
    assert!(matches!(doc.add_entity("sounds"), Err(Error::InvalidOperation(_))));

    let bytes = doc.serialize();
    let reopened = open(&bytes);
    assert_eq!(reopened.tree().group_named("binders").unwrap().len(), 1);
    assert_eq!(reopened.serialize(), bytes);
}

#[test]
fn name_paths_resolve() {
    let doc = open(&sample());
    let tree = doc.tree();
    assert!(tree.resolve("Emit[0]/ItEm[1]/PrNo").is_ok());
    assert!(tree.resolve("Emit[0]/ItEm[2]/PrNo").is_err());
    assert!(tree.resolve("Emit[7]/EVT").is_err());
    assert!(tree.resolve("Nope").is_err());
    let by_label = tree.resolve("Revised Scale X").unwrap();
    assert_eq!(by_label, tree.resolve("RvSx").unwrap());
}

// ---- properties ----

fn unknown_span() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        ("[XYZ][qxz]{3}", prop::collection::vec(any::<u8>(), 0..24))
            .prop_map(|(tag, content)| blk(&tag, &content)),
        prop::collection::vec(any::<u8>(), 1..24),
    ]
}

fn generated(version: i32, scale: f32, fast: bool, bone: &str, texture: &str) -> Vec<u8> {
    let mut path = texture.as_bytes().to_vec();
    path.push(0);
    container(&cat(&[
        int("Ver", version),
        blk("bDFP", &[fast as u8]),
        blk("RvSx", &scale.to_le_bytes()),
        blk("Bind", &blk("BNam", &padded(bone, 16, 0xFE))),
        blk("Tex", &path),
    ]))
}

proptest! {
    #[test]
    fn generated_documents_round_trip(
        version in any::<i32>(),
        scale_bits in any::<u32>(),
        fast in any::<bool>(),
        bone in "[A-Za-z_]{0,15}",
        texture in "[a-z/._]{1,40}",
    ) {
        let bytes = generated(version, f32::from_bits(scale_bits), fast, &bone, &texture);
        let doc = Document::parse(avfx(), &bytes).unwrap();
        prop_assert!(doc.diagnostics().is_empty());
        prop_assert_eq!(doc.serialize(), bytes);
    }

    #[test]
    fn unrecognized_spans_in_entities_round_trip(
        spans in prop::collection::vec(unknown_span(), 1..4),
    ) {
        let extra = spans.concat();
        let bytes = sample_with(&extra);
        let doc = Document::parse(avfx(), &bytes).unwrap();
        let emitter = &doc.tree().group_named("emitters").unwrap().get(1).unwrap().node;
        prop_assert_eq!(emitter.trailing(), extra.as_slice());
        prop_assert_eq!(doc.serialize(), bytes);
    }
}
