//! Declarative helpers shared by the state set types.

/// Define a bit-set type with named flags, `NONE`/`ANY` constants, set
/// operations, `Display` as `A|B` and string serialization.
macro_rules! state_set {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$fmeta:meta])* $flag:ident = $bit:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: $name = $name(1 << $bit); )+

            /// The empty set.
            pub const NONE: $name = $name(0);

            /// Every known flag.
            pub const ANY: $name = $name(0 $( | (1 << $bit) )+);

            const NAMED: &'static [($name, &'static str)] = &[ $( ($name::$flag, $label) ),+ ];

            /// Raw bit representation.
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Union of both sets.
            pub const fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            /// Flags present in both sets.
            pub const fn intersection(self, other: $name) -> $name {
                $name(self.0 & other.0)
            }

            /// Whether every flag of `other` is in `self`.
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Whether the two sets share at least one flag.
            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            /// Whether no flag is set.
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Iterate over the individual flags in declaration order.
            pub fn iter(self) -> impl Iterator<Item = $name> {
                Self::NAMED
                    .iter()
                    .map(|(flag, _)| *flag)
                    .filter(move |flag| self.contains(*flag))
            }

            /// Name of a single flag, `None` for empty or composite sets.
            pub fn name(self) -> Option<&'static str> {
                Self::NAMED
                    .iter()
                    .find(|(flag, _)| *flag == self)
                    .map(|(_, label)| *label)
            }
        }

        impl ::std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl ::std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl ::std::ops::BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                self.intersection(rhs)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                if self.is_empty() {
                    return write!(f, "(none)");
                }
                let mut first = true;
                for (flag, label) in Self::NAMED {
                    if self.contains(*flag) {
                        if !first {
                            write!(f, "|")?;
                        }
                        first = false;
                        write!(f, "{}", label)?;
                    }
                }
                Ok(())
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}
