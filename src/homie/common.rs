use homie5::HomieDataType;
use homie5::HomieID;
use homie5::device_description::{
    HomiePropertyDescription, HomiePropertyFormat, PropertyDescriptionBuilder,
};

use crate::convert::ValueKind;
use crate::registers::RegisterDescriptor;

pub(crate) fn homie_enum<T: strum::VariantNames>() -> PropertyDescriptionBuilder {
    PropertyDescriptionBuilder::new(HomieDataType::Enum).format(homie_enum_format::<T>())
}

pub(crate) fn homie_enum_format<T: strum::VariantNames>() -> HomiePropertyFormat {
    HomiePropertyFormat::Enum(T::VARIANTS.iter().copied().map(Into::into).collect())
}

/// Turn a free form register label into something usable as a homie ID.
///
/// `Leaving water temp. before BUH (R1T)` becomes `leaving-water-temp-before-buh-r1t`.
pub(crate) fn slug(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("register");
    }
    slug
}

pub(crate) fn registry_node_id(registry_id: u8) -> HomieID {
    HomieID::try_from(format!("registry-{registry_id:02x}"))
        .unwrap_or_else(|_| HomieID::new_const("registry"))
}

/// Read-only property describing a register's decoded values.
pub(crate) fn register_property(register: &RegisterDescriptor) -> HomiePropertyDescription {
    let mut description = match register.kind() {
        ValueKind::Numeric if register.decimals() == 0 => {
            PropertyDescriptionBuilder::new(HomieDataType::Integer)
        }
        ValueKind::Numeric => PropertyDescriptionBuilder::new(HomieDataType::Float),
        // Unknown codes come out as `unknown(n)`, so the values can't be constrained to an enum.
        ValueKind::Text => PropertyDescriptionBuilder::new(HomieDataType::String),
    }
    .retained(true)
    .settable(false)
    .build();
    description.name = Some(register.label.clone());
    description.unit = register.unit.clone();
    description
}

#[cfg(test)]
mod tests {
    use super::slug;

    #[test]
    fn label_slugs() {
        assert_eq!(slug("Leaving water temp. before BUH (R1T)"), "leaving-water-temp-before-buh-r1t");
        assert_eq!(slug("INV primary current (A)"), "inv-primary-current-a");
        assert_eq!(slug("3-way valve"), "3-way-valve");
        assert_eq!(slug("  °C  "), "c");
        assert_eq!(slug("°"), "register");
    }
}
