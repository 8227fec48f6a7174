/// Declares a UUID-backed identifier newtype with `unique()`, `Display` and `FromStr`.
#[macro_export]
macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
        pub struct $name($crate::uuid::Uuid);

        impl $name {
            pub fn unique() -> $name {
                $name($crate::uuid::Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &$crate::uuid::Uuid {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::uuid::Error;

            fn from_str(id: &str) -> Result<$name, Self::Err> {
                $crate::uuid::Uuid::parse_str(id).map($name)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}
