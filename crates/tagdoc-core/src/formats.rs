//! Built-in format descriptors.
//!
//! `avfx` models the top of a particle-effect container: schedulers,
//! timelines, emitters, particles, binders and textures, with the
//! index references between them. Anything it does not describe is still
//! carried through as unrecognized bytes.

use crate::descriptor::{ChildDef as C, Format, FormatDescriptor, GroupDef, NodeDef};
use crate::error::{Error, Result};
use crate::field::FieldKind as K;
use crate::tag::{Tag, TagOrder};

pub const BUILTIN: &[&str] = &["avfx"];

pub fn by_name(name: &str) -> Result<Format> {
    match name {
        "avfx" => avfx(),
        other => Err(Error::Descriptor(format!(
            "unknown built-in format '{other}' (known: {})",
            BUILTIN.join(", ")
        ))),
    }
}

pub fn avfx() -> Result<Format> {
    Format::new(avfx_descriptor())
}

pub fn avfx_descriptor() -> FormatDescriptor {
    let bool_leaf = |tag: &str, name: &str| C::leaf(tag, name, K::Bool { width: 1 });
    let int_leaf = |tag: &str, name: &str| C::leaf(tag, name, K::int(4));
    let float_leaf = |tag: &str, name: &str| C::leaf(tag, name, K::F32);

    FormatDescriptor {
        name: "avfx".into(),
        magic: Tag::lit("AVFX"),
        tag_order: TagOrder::Reversed,
        align: 4,
        groups: vec![
            GroupDef::new("schedulers", "Schd"),
            GroupDef::new("timelines", "TmLn"),
            GroupDef::new("emitters", "Emit"),
            GroupDef::new("particles", "Ptcl"),
            GroupDef::new("binders", "Bind"),
            GroupDef::new("textures", "Tex"),
        ],
        nodes: vec![
            NodeDef::new(
                "AVFX",
                vec![
                    int_leaf("Ver", "Version").locked(),
                    bool_leaf("bDFP", "Delay Fast Particle"),
                    C::leaf(
                        "DwLy",
                        "Draw Layer",
                        K::enumeration(4, &[(0, "Screen"), (1, "Base Upper"), (2, "Base"), (3, "Fx")]),
                    ),
                    float_leaf("RvSx", "Revised Scale X").with_default(1.0f32),
                    C::group("schedulers"),
                    C::group("timelines"),
                    C::group("emitters"),
                    C::group("particles"),
                    C::group("binders"),
                    C::group("textures"),
                ],
            )
            .named("Effect"),
            // schedulers
            NodeDef::new("Schd", vec![int_leaf("ItCn", "Item Count"), C::list("Trgr")]).named("Scheduler"),
            NodeDef::new(
                "Trgr",
                vec![
                    bool_leaf("bEna", "Enabled"),
                    int_leaf("StTm", "Start Time"),
                    C::leaf("TlNo", "Timeline", K::reference("timelines", 4, -1)),
                ],
            )
            .named("Trigger"),
            // timelines
            NodeDef::new(
                "TmLn",
                vec![
                    int_leaf("LpSt", "Loop Start"),
                    int_leaf("LpEd", "Loop End"),
                    C::leaf("BnNo", "Binder", K::reference("binders", 1, 255)),
                    C::list("Item"),
                    C::list("Clip"),
                ],
            )
            .named("Timeline"),
            NodeDef::new(
                "Item",
                vec![
                    bool_leaf("bEna", "Enabled"),
                    int_leaf("StTm", "Start Time"),
                    int_leaf("EdTm", "End Time"),
                    C::leaf("BdNo", "Binder", K::reference("binders", 4, -1)),
                    C::leaf("EmNo", "Emitter", K::reference("emitters", 4, -1)),
                ],
            )
            .named("Timeline Item"),
            NodeDef::new(
                "Clip",
                vec![
                    C::field("Type", K::padded(4, 0)),
                    C::field(
                        "Raw Ints",
                        K::IntList {
                            width: 4,
                            signed: true,
                            count: Some(4),
                        },
                    ),
                    C::field("Raw Floats", K::Vector { count: 4 }),
                    C::field("Reserved", K::Bytes { len: Some(128) }),
                ],
            )
            .named("Clip"),
            // emitters
            NodeDef::new(
                "Emit",
                vec![
                    C::leaf("Sd", "Sound", K::CString),
                    C::leaf(
                        "EVT",
                        "Emitter Type",
                        K::enumeration(4, &[(0, "Point"), (1, "Cone"), (2, "Cylinder"), (3, "Model")]),
                    ),
                    C::leaf("Pos", "Position", K::Vector { count: 3 }),
                    C::block("Life"),
                    C::list("ItEm"),
                ],
            )
            .named("Emitter"),
            NodeDef::new(
                "ItEm",
                vec![
                    bool_leaf("bEnb", "Enabled"),
                    C::leaf("PrNo", "Particle", K::reference("particles", 4, -1)),
                    int_leaf("LCnt", "Local Count"),
                ],
            )
            .named("Emitter Item"),
            NodeDef::new(
                "Life",
                vec![
                    float_leaf("Val", "Value").locked(),
                    float_leaf("ValR", "Random"),
                    C::leaf("Type", "Random Type", K::enumeration(4, &[(0, "Uniform"), (1, "Gaussian")])),
                ],
            )
            .named("Life"),
            // particles
            NodeDef::new(
                "Ptcl",
                vec![
                    C::leaf(
                        "PrVT",
                        "Particle Type",
                        K::enumeration(4, &[(0, "Parameter"), (1, "Powder"), (2, "Windmill"), (3, "Line")]),
                    ),
                    int_leaf("Cnt", "Count"),
                    C::block("Life"),
                    C::block("TC1"),
                ],
            )
            .named("Particle"),
            NodeDef::new(
                "TC1",
                vec![
                    bool_leaf("bEna", "Enabled"),
                    C::leaf("TxNo", "Texture", K::reference("textures", 4, -1)),
                ],
            )
            .named("Texture Color 1"),
            // binders
            NodeDef::new(
                "Bind",
                vec![
                    bool_leaf("StMv", "Start to Global Direction"),
                    C::leaf(
                        "BdTp",
                        "Binder Type",
                        K::enumeration(4, &[(0, "Point"), (1, "Linear"), (2, "Spline"), (3, "Camera")]),
                    ),
                    C::leaf("BNam", "Bone Name", K::padded(16, 0xFE)),
                ],
            )
            .named("Binder"),
            // textures
            NodeDef::new("Tex", vec![C::field("Path", K::CString)]).named("Texture"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::tag;

    #[test]
    fn avfx_is_consistent() {
        let fmt = avfx().unwrap();
        assert_eq!(fmt.groups().len(), 6);
        assert_eq!(fmt.group_by_tag(tag("Emit")).map(|g| g.0), Some(2));
        assert!(fmt.is_known(tag("PrNo")));
    }

    #[test]
    fn descriptor_survives_json() {
        let desc = avfx_descriptor();
        let back = FormatDescriptor::from_json(&desc.to_json().unwrap()).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn unknown_builtin() {
        assert!(matches!(by_name("scd"), Err(Error::Descriptor(_))));
    }
}
